//! Database schema definitions.
//!
//! SQL statements creating the relations the lifecycle and the nomination
//! engine read and write. Statements are idempotent and ordered so that every
//! referenced relation exists before it is referenced.

/// Registered plans.
pub const CREATE_PLAN_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS plan (
    plan_id VARCHAR(64) PRIMARY KEY,
    active BOOLEAN NOT NULL DEFAULT TRUE
)
"#;

/// Pseudo plans, keyed by their reserved name.
pub const CREATE_PLAN_PSEUDO_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS plan_pseudo (
    plan_id VARCHAR(64) PRIMARY KEY REFERENCES plan(plan_id) ON DELETE CASCADE,
    name VARCHAR(255) NOT NULL UNIQUE
)
"#;

/// Image plans.
pub const CREATE_PLAN_IMAGE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS plan_image (
    plan_id VARCHAR(64) PRIMARY KEY REFERENCES plan(plan_id) ON DELETE CASCADE,
    image VARCHAR(512) NOT NULL,
    version VARCHAR(128) NOT NULL
)
"#;

/// Input mountpoints.
pub const CREATE_INPUT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS input (
    input_id BIGSERIAL PRIMARY KEY,
    plan_id VARCHAR(64) NOT NULL REFERENCES plan(plan_id) ON DELETE CASCADE,
    path VARCHAR(1024) NOT NULL,
    UNIQUE (plan_id, path)
)
"#;

/// User-tag criteria of inputs.
pub const CREATE_TAG_INPUT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tag_input (
    input_id BIGINT NOT NULL REFERENCES input(input_id) ON DELETE CASCADE,
    key VARCHAR(255) NOT NULL,
    value VARCHAR(1024) NOT NULL,
    PRIMARY KEY (input_id, key, value),
    CHECK (key NOT LIKE 'knit#%')
)
"#;

/// Knit-id criteria of inputs.
pub const CREATE_KNITID_INPUT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS knitid_input (
    input_id BIGINT NOT NULL REFERENCES input(input_id) ON DELETE CASCADE,
    knit_id VARCHAR(64) NOT NULL,
    PRIMARY KEY (input_id, knit_id)
)
"#;

/// Timestamp criteria of inputs.
pub const CREATE_TIMESTAMP_INPUT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS timestamp_input (
    input_id BIGINT NOT NULL REFERENCES input(input_id) ON DELETE CASCADE,
    timestamp TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (input_id, timestamp)
)
"#;

/// Output mountpoints, the log mountpoint included.
pub const CREATE_OUTPUT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS output (
    output_id BIGSERIAL PRIMARY KEY,
    plan_id VARCHAR(64) NOT NULL REFERENCES plan(plan_id) ON DELETE CASCADE,
    path VARCHAR(1024) NOT NULL,
    is_log BOOLEAN NOT NULL DEFAULT FALSE,
    UNIQUE (plan_id, path)
)
"#;

/// Tags attached to every data item an output produces.
pub const CREATE_TAG_OUTPUT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tag_output (
    output_id BIGINT NOT NULL REFERENCES output(output_id) ON DELETE CASCADE,
    key VARCHAR(255) NOT NULL,
    value VARCHAR(1024) NOT NULL,
    PRIMARY KEY (output_id, key, value)
)
"#;

/// Runs.
pub const CREATE_RUN_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS run (
    run_id VARCHAR(64) PRIMARY KEY,
    plan_id VARCHAR(64) NOT NULL REFERENCES plan(plan_id),
    status VARCHAR(16) NOT NULL CHECK (status IN (
        'deactivated', 'waiting', 'ready', 'starting', 'running',
        'aborting', 'completing', 'done', 'failed', 'invalidated'
    )),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    lifecycle_suspend_until TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Exit detail, one row per run.
pub const CREATE_RUN_EXIT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS run_exit (
    run_id VARCHAR(64) PRIMARY KEY REFERENCES run(run_id) ON DELETE CASCADE,
    exit_code SMALLINT NOT NULL CHECK (exit_code BETWEEN 0 AND 255),
    message TEXT NOT NULL
)
"#;

/// Workload placeholders for image runs.
pub const CREATE_WORKER_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS worker (
    run_id VARCHAR(64) PRIMARY KEY REFERENCES run(run_id) ON DELETE CASCADE,
    name VARCHAR(255) NOT NULL UNIQUE
)
"#;

/// Data items, one per (run, output).
pub const CREATE_DATA_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS data (
    knit_id VARCHAR(64) PRIMARY KEY,
    volume_ref VARCHAR(255) NOT NULL UNIQUE,
    run_id VARCHAR(64) NOT NULL REFERENCES run(run_id),
    output_id BIGINT NOT NULL REFERENCES output(output_id),
    plan_id VARCHAR(64) NOT NULL REFERENCES plan(plan_id),
    UNIQUE (run_id, output_id)
)
"#;

/// User tags of data items.
pub const CREATE_TAG_DATA_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tag_data (
    knit_id VARCHAR(64) NOT NULL REFERENCES data(knit_id) ON DELETE CASCADE,
    key VARCHAR(255) NOT NULL,
    value VARCHAR(1024) NOT NULL,
    PRIMARY KEY (knit_id, key, value)
)
"#;

/// Derived `knit#timestamp` of data items.
pub const CREATE_KNIT_TIMESTAMP_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS knit_timestamp (
    knit_id VARCHAR(64) PRIMARY KEY REFERENCES data(knit_id) ON DELETE CASCADE,
    timestamp TIMESTAMPTZ NOT NULL
)
"#;

/// Data bound to inputs of runs. Consumed data cannot be deleted.
pub const CREATE_ASSIGN_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS assign (
    run_id VARCHAR(64) NOT NULL REFERENCES run(run_id) ON DELETE CASCADE,
    input_id BIGINT NOT NULL REFERENCES input(input_id),
    plan_id VARCHAR(64) NOT NULL REFERENCES plan(plan_id),
    knit_id VARCHAR(64) NOT NULL REFERENCES data(knit_id),
    PRIMARY KEY (run_id, input_id)
)
"#;

/// Candidate matches between inputs and data.
pub const CREATE_NOMINATION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS nomination (
    input_id BIGINT NOT NULL REFERENCES input(input_id) ON DELETE CASCADE,
    knit_id VARCHAR(64) NOT NULL REFERENCES data(knit_id) ON DELETE CASCADE,
    updated BOOLEAN NOT NULL DEFAULT TRUE,
    PRIMARY KEY (input_id, knit_id)
)
"#;

/// Volumes of discarded data awaiting reclamation.
pub const CREATE_GARBAGE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS garbage (
    knit_id VARCHAR(64) PRIMARY KEY,
    volume_ref VARCHAR(255) NOT NULL UNIQUE
)
"#;

/// Secondary indexes, one statement each.
pub const CREATE_INDEXES: [&str; 8] = [
    "CREATE INDEX IF NOT EXISTS idx_input_plan_id ON input(plan_id)",
    "CREATE INDEX IF NOT EXISTS idx_output_plan_id ON output(plan_id)",
    "CREATE INDEX IF NOT EXISTS idx_run_plan_id ON run(plan_id)",
    "CREATE INDEX IF NOT EXISTS idx_run_status ON run(status)",
    "CREATE INDEX IF NOT EXISTS idx_data_run_id ON data(run_id)",
    "CREATE INDEX IF NOT EXISTS idx_assign_knit_id ON assign(knit_id)",
    "CREATE INDEX IF NOT EXISTS idx_nomination_knit_id ON nomination(knit_id)",
    "CREATE INDEX IF NOT EXISTS idx_nomination_updated ON nomination(updated) WHERE updated",
];

/// Returns all schema creation statements in dependency order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_PLAN_TABLE,
        CREATE_PLAN_PSEUDO_TABLE,
        CREATE_PLAN_IMAGE_TABLE,
        CREATE_INPUT_TABLE,
        CREATE_TAG_INPUT_TABLE,
        CREATE_KNITID_INPUT_TABLE,
        CREATE_TIMESTAMP_INPUT_TABLE,
        CREATE_OUTPUT_TABLE,
        CREATE_TAG_OUTPUT_TABLE,
        CREATE_RUN_TABLE,
        CREATE_RUN_EXIT_TABLE,
        CREATE_WORKER_TABLE,
        CREATE_DATA_TABLE,
        CREATE_TAG_DATA_TABLE,
        CREATE_KNIT_TIMESTAMP_TABLE,
        CREATE_ASSIGN_TABLE,
        CREATE_NOMINATION_TABLE,
        CREATE_GARBAGE_TABLE,
    ]
    .into_iter()
    .chain(CREATE_INDEXES)
    .collect()
}

/// Table names.
pub mod tables {
    pub const PLAN: &str = "plan";
    pub const PLAN_PSEUDO: &str = "plan_pseudo";
    pub const PLAN_IMAGE: &str = "plan_image";
    pub const INPUT: &str = "input";
    pub const TAG_INPUT: &str = "tag_input";
    pub const KNITID_INPUT: &str = "knitid_input";
    pub const TIMESTAMP_INPUT: &str = "timestamp_input";
    pub const OUTPUT: &str = "output";
    pub const TAG_OUTPUT: &str = "tag_output";
    pub const RUN: &str = "run";
    pub const RUN_EXIT: &str = "run_exit";
    pub const WORKER: &str = "worker";
    pub const DATA: &str = "data";
    pub const TAG_DATA: &str = "tag_data";
    pub const KNIT_TIMESTAMP: &str = "knit_timestamp";
    pub const ASSIGN: &str = "assign";
    pub const NOMINATION: &str = "nomination";
    pub const GARBAGE: &str = "garbage";

    /// Every table, in creation order.
    pub const ALL: [&str; 18] = [
        PLAN,
        PLAN_PSEUDO,
        PLAN_IMAGE,
        INPUT,
        TAG_INPUT,
        KNITID_INPUT,
        TIMESTAMP_INPUT,
        OUTPUT,
        TAG_OUTPUT,
        RUN,
        RUN_EXIT,
        WORKER,
        DATA,
        TAG_DATA,
        KNIT_TIMESTAMP,
        ASSIGN,
        NOMINATION,
        GARBAGE,
    ];
}
