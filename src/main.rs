use anyhow::Context;
use node_cache::{CacheConfig, NodeCache, NodeEvent, NodeState};
use node_persistence::DieselNodeStore;
use node_state::{lookup_attributes, InProcessLockProvider};
use std::io::{self, Write};
use std::sync::Arc;
use uuid::Uuid;

/// Pequeño menú interactivo para operar el caché de nodos en
/// introspección sobre el store de `node-persistence`.
///
/// Opciones soportadas:
/// 1) Listar nodos
/// 2) Iniciar introspección
/// 3) Procesar un evento sobre un nodo
/// 4) Buscar nodo por MAC
/// 5) Finalizar introspección
/// 6) Barrer introspecciones vencidas
/// 7) Eliminar nodo
/// 8) Ver tabla de transiciones
/// 9) Salir
fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = CacheConfig::from_env().context("leyendo configuración")?;
    // Inicializar store (aplica migraciones embebidas si procede)
    let store = match &config.database_url {
        Some(url) => DieselNodeStore::new(url),
        None => node_persistence::new_from_env(),
    }.context("abriendo el store de nodos")?;
    let cache = NodeCache::new(Arc::new(store), Arc::new(InProcessLockProvider::new()), config)?;
    log::info!("node cache ready (timeout {}s)", cache.config().timeout_secs);

    loop {
        println!("\n== Inspector cache menu ==");
        println!("1) Listar nodos");
        println!("2) Iniciar introspección");
        println!("3) Procesar evento");
        println!("4) Buscar nodo por MAC");
        println!("5) Finalizar introspección");
        println!("6) Barrer introspecciones vencidas");
        println!("7) Eliminar nodo");
        println!("8) Ver tabla de transiciones");
        println!("9) Salir");
        print!("Elige una opción: ");
        io::stdout().flush().ok();

        let mut choice = String::new();
        io::stdin().read_line(&mut choice)?;
        match choice.trim() {
            "1" => match cache.list_nodes(None, None) {
                Ok(rows) => {
                    println!("\nUUID                                 | STATE      | STARTED                   | ERROR");
                    println!("----------------------------------------------------------------------------------------");
                    for r in rows {
                        println!("{} | {:<10} | {} | {}",
                                 r.uuid,
                                 r.state,
                                 r.started_at.to_rfc3339(),
                                 r.error.unwrap_or_else(|| "-".into()));
                    }
                }
                Err(e) => eprintln!("Error listando nodos: {}", e),
            },
            "2" => {
                let Some(uuid) = prompt_uuid("UUID del nodo (enter para uno nuevo): ", true)? else { continue };
                let macs = prompt("MACs separadas por coma: ")?;
                let macs: Vec<String> =
                    macs.split(',').map(str::trim).filter(|m| !m.is_empty()).map(String::from).collect();
                let manage_boot = prompt("¿Gestionar arranque? (Y/n): ")?.trim().to_lowercase() != "n";
                match cache.start_introspection(uuid, manage_boot, &lookup_attributes([("mac", macs)])) {
                    Ok(mut node) => println!("Introspección iniciada: {} ({})", uuid, node.state()?),
                    Err(e) => eprintln!("Error iniciando introspección: {}", e),
                }
            }
            "3" => {
                let Some(uuid) = prompt_uuid("UUID del nodo: ", false)? else { continue };
                let event: NodeEvent = match prompt("Evento: ")?.trim().parse() {
                    Ok(e) => e,
                    Err(e) => { eprintln!("{}", e); continue; }
                };
                let mut node = match cache.get_node(uuid, true) {
                    Ok(n) => n,
                    Err(e) => { eprintln!("Error cargando nodo: {}", e); continue; }
                };
                match node.fsm_event(event, true) {
                    Ok(state) => println!("Nuevo estado: {}", state),
                    Err(e) => eprintln!("Evento rechazado: {}", e),
                }
                node.release_lock()?;
            }
            "4" => {
                let mac = prompt("MAC: ")?;
                match cache.find_node(&lookup_attributes([("mac", vec![mac.trim()])])) {
                    Ok(mut node) => {
                        println!("Encontrado: {} ({})", node.uuid(), node.state()?);
                        node.release_lock()?;
                    }
                    Err(e) => eprintln!("Búsqueda fallida [{}]: {}", e.code(), e),
                }
            }
            "5" => {
                let Some(uuid) = prompt_uuid("UUID del nodo: ", false)? else { continue };
                let error = prompt("Mensaje de error (enter si terminó bien): ")?;
                let error = Some(error.trim().to_string()).filter(|e| !e.is_empty());
                let mut node = match cache.get_node(uuid, true) {
                    Ok(n) => n,
                    Err(e) => { eprintln!("Error cargando nodo: {}", e); continue; }
                };
                let event = if error.is_some() { node.transitions().error_event() } else { NodeEvent::Finish };
                match node.finished(event, error) {
                    Ok(()) => println!("Introspección finalizada: {} ({})", uuid, node.state()?),
                    Err(e) => eprintln!("Error finalizando: {}", e),
                }
            }
            "6" => match cache.clean_up_expired() {
                Ok(reaped) if reaped.is_empty() => println!("Nada que barrer"),
                Ok(reaped) => {
                    for uuid in reaped {
                        println!("Vencido: {}", uuid);
                    }
                }
                Err(e) => eprintln!("Error en el barrido: {}", e),
            },
            "7" => {
                let Some(uuid) = prompt_uuid("UUID del nodo a eliminar: ", false)? else { continue };
                let confirm = prompt(&format!("Confirma borrado de {}? escribir 'yes' para confirmar: ", uuid))?;
                if confirm.trim().to_lowercase() == "yes" {
                    match cache.delete_node(uuid) {
                        Ok(()) => println!("Nodo eliminado: {}", uuid),
                        Err(e) => eprintln!("Error eliminando nodo: {}", e),
                    }
                } else {
                    println!("Borrado cancelado");
                }
            }
            "8" => {
                let table = cache.transitions();
                for s in NodeState::ALL {
                    let edges: Vec<String> = table.transitions()
                                                  .filter(|t| t.from == s)
                                                  .map(|t| format!("{} -> {}", t.event, t.to))
                                                  .collect();
                    let mark = if table.is_terminal(s) { " (terminal)" } else { "" };
                    println!("{}{}: {}", s, mark, edges.join(", "));
                }
            }
            "9" => {
                println!("Saliendo...");
                break;
            }
            other => {
                println!("Opción inválida: {}", other);
            }
        }
    }

    Ok(())
}

fn prompt(msg: &str) -> io::Result<String> {
    print!("{}", msg);
    io::stdout().flush()?;
    let mut s = String::new();
    io::stdin().read_line(&mut s)?;
    Ok(s)
}

// `None` si el UUID no es válido (ya avisado por stderr).
fn prompt_uuid(msg: &str, allow_new: bool) -> io::Result<Option<Uuid>> {
    let raw = prompt(msg)?;
    let raw = raw.trim();
    if raw.is_empty() && allow_new {
        return Ok(Some(Uuid::new_v4()));
    }
    match Uuid::parse_str(raw) {
        Ok(u) => Ok(Some(u)),
        Err(_) => {
            eprintln!("UUID inválido");
            Ok(None)
        }
    }
}
