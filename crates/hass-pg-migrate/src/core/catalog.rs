//! Static catalog of the Home Assistant recorder tables.
//!
//! Column lists follow the recorder schema; dependencies mirror the foreign
//! keys declared by the PostgreSQL schema. `states.old_state_id` references
//! `states` itself and is therefore not a dependency.

use super::schema::{TableCategory, TableSpec, TransformKind};

/// All recorder tables in catalog order.
pub fn recorder_tables() -> Vec<TableSpec> {
    use TableCategory::*;
    use TransformKind::*;

    vec![
        TableSpec::new("event_types", "event_type_id", &["event_type_id", "event_type"])
            .category(Event),
        TableSpec::new("event_data", "data_id", &["data_id", "hash", "shared_data"])
            .category(Event),
        TableSpec::new(
            "events",
            "event_id",
            &[
                "event_id",
                "event_type",
                "event_data",
                "origin",
                "origin_idx",
                "time_fired",
                "time_fired_ts",
                "context_id",
                "context_user_id",
                "context_parent_id",
                "data_id",
                "context_id_bin",
                "context_user_id_bin",
                "context_parent_id_bin",
                "event_type_id",
            ],
        )
        .depends_on(&["event_types", "event_data"])
        .transform("time_fired", Timestamp)
        .category(Event),
        TableSpec::new("state_attributes", "attributes_id", &["attributes_id", "hash", "shared_attrs"])
            .category(State),
        TableSpec::new("states_meta", "metadata_id", &["metadata_id", "entity_id"]).category(State),
        TableSpec::new(
            "states",
            "state_id",
            &[
                "state_id",
                "entity_id",
                "state",
                "attributes",
                "event_id",
                "last_changed",
                "last_changed_ts",
                "last_reported_ts",
                "last_updated",
                "last_updated_ts",
                "old_state_id",
                "attributes_id",
                "context_id",
                "context_user_id",
                "context_parent_id",
                "origin_idx",
                "context_id_bin",
                "context_user_id_bin",
                "context_parent_id_bin",
                "metadata_id",
            ],
        )
        .depends_on(&["events", "state_attributes", "states_meta"])
        .transform("last_changed", Timestamp)
        .transform("last_updated", Timestamp)
        .category(State),
        TableSpec::new(
            "statistics_meta",
            "id",
            &[
                "id",
                "statistic_id",
                "source",
                "unit_of_measurement",
                "unit_class",
                "has_mean",
                "has_sum",
                "name",
                "mean_type",
            ],
        )
        .transform("has_mean", Boolean)
        .transform("has_sum", Boolean)
        .category(Statistics),
        statistics_table("statistics"),
        statistics_table("statistics_short_term"),
        TableSpec::new(
            "recorder_runs",
            "run_id",
            &["run_id", "start", "end", "closed_incorrect", "created"],
        )
        .transform("start", Timestamp)
        .transform("end", Timestamp)
        .transform("created", Timestamp)
        .transform("closed_incorrect", Boolean)
        .category(System),
        TableSpec::new("statistics_runs", "run_id", &["run_id", "start"])
            .transform("start", Timestamp)
            .category(System),
        TableSpec::new(
            "schema_changes",
            "change_id",
            &["change_id", "schema_version", "changed"],
        )
        .transform("changed", Timestamp)
        .category(System),
        TableSpec::new("migration_changes", "migration_id", &["migration_id", "version"])
            .text_key()
            .category(System),
    ]
}

fn statistics_table(name: &str) -> TableSpec {
    TableSpec::new(
        name,
        "id",
        &[
            "id",
            "created",
            "created_ts",
            "metadata_id",
            "start",
            "start_ts",
            "mean",
            "mean_weight",
            "min",
            "max",
            "last_reset",
            "last_reset_ts",
            "state",
            "sum",
        ],
    )
    .depends_on(&["statistics_meta"])
    .transform("created", TransformKind::Timestamp)
    .transform("start", TransformKind::Timestamp)
    .transform("last_reset", TransformKind::Timestamp)
    .category(TableCategory::Statistics)
}

/// Look up a recorder table by name.
pub fn find_table(name: &str) -> Option<TableSpec> {
    recorder_tables().into_iter().find(|t| t.name == name)
}
