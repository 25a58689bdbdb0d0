//! SQL schema for the Postgres backend
//!
//! Statements are idempotent and applied in order at startup.

pub const CREATE_PIPELINES: &str = r#"
    CREATE TABLE IF NOT EXISTS pipelines (
        id UUID PRIMARY KEY,
        name VARCHAR(100) NOT NULL,
        description TEXT,
        pipeline_type VARCHAR(20) NOT NULL CHECK (pipeline_type IN ('person', 'church', 'custom')),
        scope VARCHAR(255) NOT NULL,
        is_main BOOLEAN NOT NULL DEFAULT false,
        parent_stage VARCHAR(50),
        active BOOLEAN NOT NULL DEFAULT true,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
"#;

/// At most one main pipeline per (type, scope)
pub const CREATE_MAIN_PIPELINE_INDEX: &str = r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_pipelines_main
        ON pipelines (pipeline_type, scope)
        WHERE is_main
"#;

pub const CREATE_STAGES: &str = r#"
    CREATE TABLE IF NOT EXISTS pipeline_stages (
        id UUID PRIMARY KEY,
        pipeline_id UUID NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
        name VARCHAR(100) NOT NULL,
        description TEXT,
        stage_order INTEGER NOT NULL,
        color VARCHAR(7) NOT NULL DEFAULT '#3498db',
        auto_move_days INTEGER CHECK (auto_move_days IS NULL OR auto_move_days > 0),
        auto_reminder BOOLEAN NOT NULL DEFAULT false,
        auto_task_template JSONB,
        active BOOLEAN NOT NULL DEFAULT true,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        CONSTRAINT uq_stage_order UNIQUE (pipeline_id, stage_order) DEFERRABLE INITIALLY DEFERRED
    )
"#;

pub const CREATE_PLACEMENTS: &str = r#"
    CREATE TABLE IF NOT EXISTS placements (
        id UUID PRIMARY KEY,
        item_ref VARCHAR(255) NOT NULL,
        pipeline_id UUID NOT NULL REFERENCES pipelines(id) ON DELETE RESTRICT,
        current_stage_id UUID NOT NULL REFERENCES pipeline_stages(id) ON DELETE RESTRICT,
        entered_at TIMESTAMPTZ NOT NULL,
        last_updated TIMESTAMPTZ NOT NULL,
        CONSTRAINT uq_placement_item UNIQUE (item_ref, pipeline_id)
    )
"#;

pub const CREATE_TRANSITIONS: &str = r#"
    CREATE TABLE IF NOT EXISTS transition_records (
        seq BIGSERIAL UNIQUE,
        id UUID PRIMARY KEY,
        placement_id UUID NOT NULL REFERENCES placements(id) ON DELETE CASCADE,
        pipeline_id UUID NOT NULL,
        from_stage_id UUID,
        to_stage_id UUID NOT NULL,
        actor_id UUID,
        notes TEXT,
        created_at TIMESTAMPTZ NOT NULL
    )
"#;

pub const CREATE_DERIVED_TASKS: &str = r#"
    CREATE TABLE IF NOT EXISTS derived_tasks (
        transition_id UUID PRIMARY KEY REFERENCES transition_records(id) ON DELETE CASCADE,
        task_handle VARCHAR(255),
        claimed_at TIMESTAMPTZ NOT NULL
    )
"#;

pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_stages_pipeline ON pipeline_stages(pipeline_id)",
    "CREATE INDEX IF NOT EXISTS idx_placements_stage ON placements(current_stage_id, last_updated)",
    "CREATE INDEX IF NOT EXISTS idx_placements_pipeline ON placements(pipeline_id)",
    "CREATE INDEX IF NOT EXISTS idx_transitions_placement ON transition_records(placement_id, seq)",
    "CREATE INDEX IF NOT EXISTS idx_transitions_pipeline ON transition_records(pipeline_id, seq)",
    "CREATE INDEX IF NOT EXISTS idx_transitions_to_stage ON transition_records(to_stage_id, created_at)",
];

/// Every statement, in application order
pub fn statements() -> Vec<&'static str> {
    let mut all = vec![
        CREATE_PIPELINES,
        CREATE_MAIN_PIPELINE_INDEX,
        CREATE_STAGES,
        CREATE_PLACEMENTS,
        CREATE_TRANSITIONS,
        CREATE_DERIVED_TASKS,
    ];
    all.extend_from_slice(CREATE_INDEXES);
    all
}
