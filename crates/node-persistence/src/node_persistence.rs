use crate::schema;
use crate::schema::attributes::dsl as attr_dsl;
use crate::schema::introspection_data::dsl as data_dsl;
use crate::schema::nodes::dsl as nodes_dsl;
use crate::schema::options::dsl as opt_dsl;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::result::Error as DieselError;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use node_state::{LookupAttributes, NodeError, NodeRow, NodeState, NodeStore, NodeUpdate, Result};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");
#[cfg(not(feature = "pg"))]
type DbConn = SqliteConnection;
#[cfg(feature = "pg")]
type DbConn = PgConnection;
type DbPool = Pool<ConnectionManager<DbConn>>;
/// Aplica `busy_timeout` en cada conexión SQLite del pool: varios actores
/// escriben el mismo fichero de forma concurrente.
#[cfg(not(feature = "pg"))]
#[derive(Debug)]
struct SqlitePragmas;
#[cfg(not(feature = "pg"))]
impl diesel::r2d2::CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
  fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
    diesel::sql_query("PRAGMA busy_timeout = 5000;").execute(conn).map_err(diesel::r2d2::Error::QueryError)?;
    Ok(())
  }
}
/// Repo Diesel que implementa `NodeStore`.
pub struct DieselNodeStore {
  pool: Arc<DbPool>,
}
impl DieselNodeStore {
  /// Crea el pool, ajusta SQLite (WAL) y ejecuta las migraciones embebidas.
  pub fn new(database_url: &str) -> Result<Self> {
    let manager = ConnectionManager::<DbConn>::new(database_url);
    let builder = Pool::builder().max_size(4);
    #[cfg(not(feature = "pg"))]
    let builder = builder.connection_customizer(Box::new(SqlitePragmas));
    let pool = builder.build(manager).map_err(|e| NodeError::Storage(format!("pool: {}", e)))?;
    let store = DieselNodeStore { pool: Arc::new(pool) };
    let mut c = store.conn()?;
    #[cfg(not(feature = "pg"))]
    let _ = diesel::sql_query("PRAGMA journal_mode = WAL;").execute(&mut c);
    c.run_pending_migrations(MIGRATIONS).map_err(|e| NodeError::Storage(format!("migrations: {}", e)))?;
    log::debug!("node cache store ready ({} pooled connections)", store.pool.max_size());
    Ok(store)
  }
  fn conn_raw(&self) -> std::result::Result<PooledConnection<ConnectionManager<DbConn>>, r2d2::Error> {
    self.pool.get()
  }
  fn conn(&self) -> Result<PooledConnection<ConnectionManager<DbConn>>> {
    self.conn_raw().map_err(|e| NodeError::Storage(format!("pool: {}", e)))
  }
}
// Diesel row structs for the node cache tables
#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = schema::nodes)]
struct NodeRecord {
  pub uuid: String,
  pub state: String,
  pub version_id: String,
  pub started_at_ts: i64,
  pub finished_at_ts: Option<i64>,
  pub error: Option<String>,
  pub manage_boot: Option<bool>,
}
#[derive(Debug, AsChangeset)]
#[diesel(table_name = schema::nodes)]
struct NodeChangeset {
  pub state: Option<String>,
  pub version_id: Option<String>,
  pub finished_at_ts: Option<Option<i64>>,
  pub error: Option<Option<String>>,
  pub manage_boot: Option<Option<bool>>,
}
#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = schema::attributes)]
struct AttributeRecord {
  pub id: String,
  pub name: String,
  pub value: String,
  pub node_uuid: String,
}
#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = schema::options)]
struct OptionRecord {
  pub node_uuid: String,
  pub name: String,
  pub value: String,
}
#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = schema::introspection_data)]
struct DataRecord {
  pub node_uuid: String,
  pub processed: bool,
  pub data: String,
}
/// Error interno de las transacciones: Diesel exige `From<DieselError>`.
#[derive(Debug, thiserror::Error)]
enum TxError {
  #[error("db: {0}")]
  Db(#[from] DieselError),
  #[error(transparent)]
  Node(NodeError),
}
impl From<TxError> for NodeError {
  fn from(e: TxError) -> Self {
    match e {
      TxError::Db(e) => NodeError::Storage(format!("db: {}", e)),
      TxError::Node(e) => e,
    }
  }
}
fn map_db_err<T>(res: std::result::Result<T, DieselError>) -> Result<T> {
  res.map_err(|e| NodeError::Storage(format!("db: {}", e)))
}
fn to_ts(t: DateTime<Utc>) -> i64 {
  t.timestamp_millis()
}
fn from_ts(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms).ok_or_else(|| NodeError::Storage(format!("invalid timestamp: {}", ms)))
}
fn parse_uuid(s: &str) -> Result<Uuid> {
  Uuid::parse_str(s).map_err(|e| NodeError::Storage(format!("invalid uuid: {}", e)))
}
impl NodeRecord {
  fn from_row(row: &NodeRow) -> Self {
    NodeRecord { uuid: row.uuid.to_string(),
                 state: row.state.to_string(),
                 version_id: row.version_id.clone(),
                 started_at_ts: to_ts(row.started_at),
                 finished_at_ts: row.finished_at.map(to_ts),
                 error: row.error.clone(),
                 manage_boot: Some(row.manage_boot) }
  }
  fn into_row(self) -> Result<NodeRow> {
    let state = self.state.parse::<NodeState>().map_err(NodeError::Storage)?;
    Ok(NodeRow { uuid: parse_uuid(&self.uuid)?,
                 state,
                 version_id: self.version_id,
                 started_at: from_ts(self.started_at_ts)?,
                 finished_at: self.finished_at_ts.map(from_ts).transpose()?,
                 error: self.error,
                 // legacy rows: NULL means the node boot is managed
                 manage_boot: self.manage_boot.unwrap_or(true) })
  }
}
fn purge_node(conn: &mut DbConn, id_s: &str) -> std::result::Result<(), DieselError> {
  diesel::delete(attr_dsl::attributes.filter(attr_dsl::node_uuid.eq(id_s))).execute(conn)?;
  diesel::delete(opt_dsl::options.filter(opt_dsl::node_uuid.eq(id_s))).execute(conn)?;
  diesel::delete(data_dsl::introspection_data.filter(data_dsl::node_uuid.eq(id_s))).execute(conn)?;
  diesel::delete(nodes_dsl::nodes.filter(nodes_dsl::uuid.eq(id_s))).execute(conn)?;
  Ok(())
}
fn node_exists(conn: &mut DbConn, id_s: &str) -> std::result::Result<bool, DieselError> {
  Ok(nodes_dsl::nodes.filter(nodes_dsl::uuid.eq(id_s))
                     .select(nodes_dsl::uuid)
                     .first::<String>(conn)
                     .optional()?
                     .is_some())
}
impl NodeStore for DieselNodeStore {
  fn get_node(&self, uuid: &Uuid) -> Result<Option<NodeRow>> {
    let mut conn = self.conn()?;
    let opt = map_db_err(nodes_dsl::nodes.filter(nodes_dsl::uuid.eq(uuid.to_string()))
                                         .first::<NodeRecord>(&mut conn)
                                         .optional())?;
    opt.map(NodeRecord::into_row).transpose()
  }
  fn replace_node(&self, row: &NodeRow, attributes: &LookupAttributes) -> Result<()> {
    let mut pooled = self.conn()?;
    let conn: &mut DbConn = &mut pooled;
    let id_s = row.uuid.to_string();
    let record = NodeRecord::from_row(row);
    conn.transaction::<_, TxError, _>(|conn| {
          purge_node(conn, &id_s)?;
          diesel::insert_into(nodes_dsl::nodes).values(&record).execute(conn)?;
          for (name, values) in attributes {
            for v in values {
              let ar = AttributeRecord { id: Uuid::new_v4().to_string(),
                                         name: name.clone(),
                                         value: v.clone(),
                                         node_uuid: id_s.clone() };
              diesel::insert_into(attr_dsl::attributes).values(&ar).execute(conn)?;
            }
          }
          Ok(())
        })?;
    Ok(())
  }
  fn compare_and_swap(&self,
                      uuid: &Uuid,
                      expected_version: &str,
                      new_version: &str,
                      update: &NodeUpdate)
                      -> Result<()> {
    let mut conn = self.conn()?;
    let changes = NodeChangeset { state: update.state.map(|s| s.to_string()),
                                  version_id: Some(new_version.to_string()),
                                  finished_at_ts: update.finished_at.map(|f| f.map(to_ts)),
                                  error: update.error.clone(),
                                  manage_boot: update.manage_boot.map(Some) };
    // la condición sobre version_id hace del UPDATE un compare-and-swap
    let updated = map_db_err(diesel::update(nodes_dsl::nodes.filter(nodes_dsl::uuid.eq(uuid.to_string()))
                                                            .filter(nodes_dsl::version_id.eq(expected_version)))
                             .set(&changes)
                             .execute(&mut conn))?;
    if updated == 0 {
      return Err(NodeError::RaceCondition(uuid.to_string()));
    }
    Ok(())
  }
  fn delete_node(&self, uuid: &Uuid) -> Result<()> {
    let mut pooled = self.conn()?;
    let conn: &mut DbConn = &mut pooled;
    let id_s = uuid.to_string();
    map_db_err(conn.transaction::<_, DieselError, _>(|conn| purge_node(conn, &id_s)))
  }
  fn clear_lookup_data(&self, uuid: &Uuid) -> Result<()> {
    let mut pooled = self.conn()?;
    let conn: &mut DbConn = &mut pooled;
    let id_s = uuid.to_string();
    map_db_err(conn.transaction::<_, DieselError, _>(|conn| {
                     diesel::delete(attr_dsl::attributes.filter(attr_dsl::node_uuid.eq(&id_s))).execute(conn)?;
                     diesel::delete(opt_dsl::options.filter(opt_dsl::node_uuid.eq(&id_s))).execute(conn)?;
                     Ok(())
                   }))
  }
  fn get_attributes(&self, uuid: &Uuid) -> Result<LookupAttributes> {
    let mut conn = self.conn()?;
    let rows = map_db_err(attr_dsl::attributes.filter(attr_dsl::node_uuid.eq(uuid.to_string()))
                                              .load::<AttributeRecord>(&mut conn))?;
    let mut out = LookupAttributes::new();
    for r in rows {
      out.entry(r.name).or_default().push(r.value);
    }
    Ok(out)
  }
  fn add_attribute(&self, uuid: &Uuid, name: &str, values: &[String]) -> Result<()> {
    let mut pooled = self.conn()?;
    let conn: &mut DbConn = &mut pooled;
    let id_s = uuid.to_string();
    conn.transaction::<_, TxError, _>(|conn| {
          if !node_exists(conn, &id_s)? {
            return Err(TxError::Node(NodeError::NotFoundInCache(format!("node {}", id_s))));
          }
          for v in values {
            let ar = AttributeRecord { id: Uuid::new_v4().to_string(),
                                       name: name.to_string(),
                                       value: v.clone(),
                                       node_uuid: id_s.clone() };
            diesel::insert_into(attr_dsl::attributes).values(&ar).execute(conn)?;
          }
          Ok(())
        })?;
    Ok(())
  }
  fn find_attribute_matches(&self, name: &str, values: &[String]) -> Result<Vec<Uuid>> {
    let mut conn = self.conn()?;
    let rows = map_db_err(attr_dsl::attributes.filter(attr_dsl::name.eq(name))
                                              .filter(attr_dsl::value.eq_any(values))
                                              .select(attr_dsl::node_uuid)
                                              .load::<String>(&mut conn))?;
    rows.iter().map(|s| parse_uuid(s)).collect()
  }
  fn active_attribute_values(&self, name: &str) -> Result<Vec<String>> {
    let mut conn = self.conn()?;
    let active = map_db_err(nodes_dsl::nodes.filter(nodes_dsl::finished_at_ts.is_null())
                                            .select(nodes_dsl::uuid)
                                            .load::<String>(&mut conn))?;
    map_db_err(attr_dsl::attributes.filter(attr_dsl::name.eq(name))
                                   .filter(attr_dsl::node_uuid.eq_any(&active))
                                   .select(attr_dsl::value)
                                   .load::<String>(&mut conn))
  }
  fn get_options(&self, uuid: &Uuid) -> Result<HashMap<String, JsonValue>> {
    let mut conn = self.conn()?;
    let rows = map_db_err(opt_dsl::options.filter(opt_dsl::node_uuid.eq(uuid.to_string()))
                                          .load::<OptionRecord>(&mut conn))?;
    let mut out = HashMap::with_capacity(rows.len());
    for r in rows {
      out.insert(r.name, serde_json::from_str(&r.value)?);
    }
    Ok(out)
  }
  fn set_option(&self, uuid: &Uuid, name: &str, value: &JsonValue) -> Result<()> {
    let mut pooled = self.conn()?;
    let conn: &mut DbConn = &mut pooled;
    let id_s = uuid.to_string();
    let row = OptionRecord { node_uuid: id_s.clone(),
                             name: name.to_string(),
                             value: value.to_string() };
    // upsert portable: delete + insert dentro de la misma transacción
    conn.transaction::<_, TxError, _>(|conn| {
          if !node_exists(conn, &id_s)? {
            return Err(TxError::Node(NodeError::NotFoundInCache(format!("node {}", id_s))));
          }
          diesel::delete(opt_dsl::options.filter(opt_dsl::node_uuid.eq(&id_s)).filter(opt_dsl::name.eq(name))).execute(conn)?;
          diesel::insert_into(opt_dsl::options).values(&row).execute(conn)?;
          Ok(())
        })?;
    Ok(())
  }
  fn list_stale(&self, deadline: DateTime<Utc>) -> Result<Vec<NodeRow>> {
    let mut conn = self.conn()?;
    let rows = map_db_err(nodes_dsl::nodes.filter(nodes_dsl::finished_at_ts.is_null())
                                          .filter(nodes_dsl::started_at_ts.lt(to_ts(deadline)))
                                          .order(nodes_dsl::started_at_ts.asc())
                                          .load::<NodeRecord>(&mut conn))?;
    rows.into_iter().map(NodeRecord::into_row).collect()
  }
  fn list_nodes(&self, state: Option<NodeState>, limit: Option<usize>) -> Result<Vec<NodeRow>> {
    let mut conn = self.conn()?;
    let mut query = nodes_dsl::nodes.into_boxed();
    if let Some(s) = state {
      query = query.filter(nodes_dsl::state.eq(s.to_string()));
    }
    query = query.order(nodes_dsl::started_at_ts.desc());
    if let Some(l) = limit {
      query = query.limit(i64::try_from(l).unwrap_or(i64::MAX));
    }
    let rows = map_db_err(query.load::<NodeRecord>(&mut conn))?;
    rows.into_iter().map(NodeRecord::into_row).collect()
  }
  fn list_uuids(&self) -> Result<Vec<Uuid>> {
    let mut conn = self.conn()?;
    let rows = map_db_err(nodes_dsl::nodes.select(nodes_dsl::uuid).load::<String>(&mut conn))?;
    rows.iter().map(|s| parse_uuid(s)).collect()
  }
  fn any_active(&self) -> Result<bool> {
    let mut conn = self.conn()?;
    map_db_err(diesel::select(diesel::dsl::exists(nodes_dsl::nodes.filter(nodes_dsl::finished_at_ts.is_null())))
                 .get_result::<bool>(&mut conn))
  }
  fn store_introspection_data(&self, uuid: &Uuid, processed: bool, data: &[u8]) -> Result<()> {
    let mut pooled = self.conn()?;
    let conn: &mut DbConn = &mut pooled;
    let row = DataRecord { node_uuid: uuid.to_string(),
                           processed,
                           data: BASE64.encode(data) };
    map_db_err(conn.transaction::<_, DieselError, _>(|conn| {
                     diesel::delete(data_dsl::introspection_data.filter(data_dsl::node_uuid.eq(&row.node_uuid))
                                                                .filter(data_dsl::processed.eq(processed))).execute(conn)?;
                     diesel::insert_into(data_dsl::introspection_data).values(&row).execute(conn)?;
                     Ok(())
                   }))
  }
  fn get_introspection_data(&self, uuid: &Uuid, processed: bool) -> Result<Option<Vec<u8>>> {
    let mut conn = self.conn()?;
    let opt = map_db_err(data_dsl::introspection_data.filter(data_dsl::node_uuid.eq(uuid.to_string()))
                                                     .filter(data_dsl::processed.eq(processed))
                                                     .select(data_dsl::data)
                                                     .first::<String>(&mut conn)
                                                     .optional())?;
    opt.map(|encoded| BASE64.decode(encoded).map_err(|e| NodeError::Storage(format!("introspection data: {}", e))))
       .transpose()
  }
}
/// Crear store desde las variables de entorno (o SQLite in-memory
/// compartido por defecto).
///
/// `INSPECTOR_DB_URL` tiene prioridad; `DATABASE_URL` es el fallback.
#[cfg(not(feature = "pg"))]
pub fn new_from_env() -> Result<DieselNodeStore> {
  dotenvy::dotenv().ok();
  let url = std::env::var("INSPECTOR_DB_URL").or_else(|_| std::env::var("DATABASE_URL"))
                                             .unwrap_or_else(|_| "file:inspector?mode=memory&cache=shared".into());
  let url_l = url.to_lowercase();
  if url_l.starts_with("postgres") {
    return Err(NodeError::Storage("node-persistence was compiled without 'pg' feature; enable the 'pg' feature to use \
                                   Postgres"
                                            .into()));
  }
  DieselNodeStore::new(&url)
}
#[cfg(feature = "pg")]
pub fn new_from_env() -> Result<DieselNodeStore> {
  dotenvy::dotenv().ok();
  let url = std::env::var("INSPECTOR_DB_URL").or_else(|_| std::env::var("DATABASE_URL"))
                                             .map_err(|_| NodeError::Storage("INSPECTOR_DB_URL / DATABASE_URL not set".into()))?;
  let l = url.to_lowercase();
  if !(l.starts_with("postgres") || l.starts_with("postgresql://") || url.contains('@')) {
    return Err(NodeError::Storage("INSPECTOR_DB_URL / DATABASE_URL does not look like Postgres URL".into()));
  }
  DieselNodeStore::new(&url)
}
