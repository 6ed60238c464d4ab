// Diesel schema del caché de nodos.
// Tablas: nodes, attributes, options, introspection_data
use diesel::allow_tables_to_appear_in_same_query;
diesel::table! {
    nodes (uuid) {
        uuid -> Text,
        state -> Text,
        version_id -> Text,
        started_at_ts -> BigInt,
        finished_at_ts -> Nullable<BigInt>,
        error -> Nullable<Text>,
        manage_boot -> Nullable<Bool>,
    }
}
diesel::table! {
    attributes (id) {
        id -> Text,
        name -> Text,
        value -> Text,
        node_uuid -> Text,
    }
}
diesel::table! {
    options (node_uuid, name) {
        node_uuid -> Text,
        name -> Text,
        value -> Text,
    }
}
diesel::table! {
    introspection_data (node_uuid, processed) {
        node_uuid -> Text,
        processed -> Bool,
        data -> Text,
    }
}
allow_tables_to_appear_in_same_query!(nodes, attributes, options, introspection_data);
