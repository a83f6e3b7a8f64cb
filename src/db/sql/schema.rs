//! Table definitions, created idempotently at connect time.

use super::Dialect;

/// DDL for every table and index, in dependency order.
pub(crate) fn statements(dialect: Dialect) -> Vec<String> {
    let blob = dialect.blob_type();
    let serial = dialect.serial_key();

    let mut ddl = vec![
        "CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            git_repo TEXT NOT NULL DEFAULT '',
            branch TEXT NOT NULL DEFAULT '',
            beads_path TEXT NOT NULL DEFAULT '',
            parent_id TEXT,
            is_perpetual BIGINT NOT NULL DEFAULT 0,
            is_sticky BIGINT NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            git_strategy TEXT NOT NULL,
            context TEXT NOT NULL DEFAULT '{}',
            schema_version TEXT NOT NULL DEFAULT '',
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            closed_at BIGINT
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL DEFAULT '',
            email TEXT NOT NULL DEFAULT '',
            created_at BIGINT NOT NULL
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS beads (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            priority TEXT NOT NULL,
            type TEXT NOT NULL,
            status TEXT NOT NULL,
            assigned_to TEXT NOT NULL DEFAULT '',
            context TEXT NOT NULL DEFAULT '{}',
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            role TEXT NOT NULL,
            persona_name TEXT NOT NULL DEFAULT '',
            provider_id TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            current_bead TEXT NOT NULL DEFAULT '',
            project_id TEXT NOT NULL DEFAULT '',
            position_id TEXT NOT NULL DEFAULT '',
            started_at BIGINT NOT NULL,
            last_active BIGINT NOT NULL
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS workflows (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            workflow_type TEXT NOT NULL,
            is_default BIGINT NOT NULL DEFAULT 0,
            project_id TEXT NOT NULL DEFAULT ''
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS workflow_nodes (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL,
            node_key TEXT NOT NULL,
            node_type TEXT NOT NULL,
            role_required TEXT NOT NULL DEFAULT '',
            persona_hint TEXT NOT NULL DEFAULT '',
            max_attempts BIGINT NOT NULL DEFAULT 0,
            timeout_minutes BIGINT NOT NULL DEFAULT 0,
            instructions TEXT NOT NULL DEFAULT '',
            metadata TEXT NOT NULL DEFAULT '{}',
            ordinal BIGINT NOT NULL,
            UNIQUE (workflow_id, node_key)
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS workflow_edges (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL,
            from_node_key TEXT NOT NULL DEFAULT '',
            to_node_key TEXT NOT NULL DEFAULT '',
            edge_condition TEXT NOT NULL,
            priority BIGINT NOT NULL DEFAULT 0,
            ordinal BIGINT NOT NULL
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS workflow_executions (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL,
            bead_id TEXT NOT NULL UNIQUE,
            project_id TEXT NOT NULL DEFAULT '',
            current_node_key TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            cycle_count BIGINT NOT NULL DEFAULT 0,
            node_attempt_count BIGINT NOT NULL DEFAULT 0,
            started_at BIGINT NOT NULL,
            completed_at BIGINT,
            escalated_at BIGINT,
            last_node_at BIGINT NOT NULL
        )"
        .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS workflow_execution_history (
            seq {serial},
            id TEXT NOT NULL UNIQUE,
            execution_id TEXT NOT NULL,
            node_key TEXT NOT NULL DEFAULT '',
            agent_id TEXT NOT NULL DEFAULT '',
            edge_condition TEXT NOT NULL,
            result_data TEXT NOT NULL DEFAULT 'null',
            attempt_number BIGINT NOT NULL DEFAULT 0,
            created_at BIGINT NOT NULL
        )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS providers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            endpoint TEXT NOT NULL DEFAULT '',
            model TEXT NOT NULL DEFAULT '',
            configured_model TEXT NOT NULL DEFAULT '',
            selected_model TEXT NOT NULL DEFAULT '',
            selection_reason TEXT NOT NULL DEFAULT '',
            model_score DOUBLE PRECISION NOT NULL DEFAULT 0,
            selected_gpu TEXT NOT NULL DEFAULT '',
            gpu_constraints TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            requires_key BIGINT NOT NULL DEFAULT 0,
            key_id TEXT NOT NULL DEFAULT '',
            api_key_encrypted {blob},
            owner_id TEXT NOT NULL DEFAULT '',
            is_shared BIGINT NOT NULL DEFAULT 1,
            status TEXT NOT NULL,
            last_heartbeat_at BIGINT,
            last_heartbeat_latency_ms BIGINT NOT NULL DEFAULT 0,
            last_heartbeat_error TEXT NOT NULL DEFAULT '',
            cost_per_mtoken DOUBLE PRECISION NOT NULL DEFAULT 0,
            context_window BIGINT NOT NULL DEFAULT 0,
            supports_function BIGINT NOT NULL DEFAULT 0,
            supports_vision BIGINT NOT NULL DEFAULT 0,
            supports_streaming BIGINT NOT NULL DEFAULT 0,
            tags TEXT NOT NULL DEFAULT '[]',
            metrics TEXT NOT NULL DEFAULT '{{}}',
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS credentials (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            type TEXT NOT NULL,
            private_key_encrypted {blob},
            public_key TEXT NOT NULL DEFAULT '',
            key_id TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            rotated_at BIGINT
        )"
        ),
        "CREATE TABLE IF NOT EXISTS conversation_contexts (
            session_id TEXT PRIMARY KEY,
            bead_id TEXT NOT NULL DEFAULT '',
            project_id TEXT NOT NULL DEFAULT '',
            messages TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            token_count BIGINT NOT NULL DEFAULT 0,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            expires_at BIGINT NOT NULL
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS activity_feed (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            occurred_at BIGINT NOT NULL,
            actor_id TEXT NOT NULL DEFAULT '',
            project_id TEXT NOT NULL DEFAULT '',
            resource_type TEXT NOT NULL DEFAULT '',
            resource_id TEXT NOT NULL DEFAULT '',
            action TEXT NOT NULL DEFAULT '',
            aggregation_key TEXT,
            aggregation_count BIGINT NOT NULL DEFAULT 1,
            visibility TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}'
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS notifications (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            message TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            priority TEXT NOT NULL,
            resource_id TEXT NOT NULL DEFAULT '',
            created_at BIGINT NOT NULL,
            read_at BIGINT,
            archived_at BIGINT
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS notification_preferences (
            user_id TEXT PRIMARY KEY,
            digest_mode TEXT NOT NULL,
            quiet_start BIGINT,
            quiet_end BIGINT,
            min_priority TEXT NOT NULL,
            subscribed_events TEXT NOT NULL DEFAULT '[]'
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS comments (
            id TEXT PRIMARY KEY,
            bead_id TEXT NOT NULL,
            parent_id TEXT,
            author_id TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            edited BIGINT NOT NULL DEFAULT 0,
            deleted BIGINT NOT NULL DEFAULT 0
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS mentions (
            id TEXT PRIMARY KEY,
            comment_id TEXT NOT NULL,
            mentioned_user_id TEXT NOT NULL,
            notified_at BIGINT
        )"
        .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS lessons (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT '',
            title TEXT NOT NULL DEFAULT '',
            detail TEXT NOT NULL DEFAULT '',
            source_bead_id TEXT NOT NULL DEFAULT '',
            source_agent_id TEXT NOT NULL DEFAULT '',
            relevance_score DOUBLE PRECISION NOT NULL DEFAULT 1,
            created_at BIGINT NOT NULL,
            embedding {blob}
        )"
        ),
        "CREATE TABLE IF NOT EXISTS project_memory (
            project_id TEXT NOT NULL,
            category TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL DEFAULT '',
            confidence DOUBLE PRECISION NOT NULL DEFAULT 1,
            updated_at BIGINT NOT NULL,
            source_bead TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (project_id, category, key)
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS advisory_locks (
            lock_name TEXT PRIMARY KEY,
            instance_id TEXT NOT NULL,
            acquired_at BIGINT NOT NULL,
            expires_at BIGINT NOT NULL,
            heartbeat_at BIGINT NOT NULL
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS instances (
            instance_id TEXT PRIMARY KEY,
            hostname TEXT NOT NULL DEFAULT '',
            started_at BIGINT NOT NULL,
            last_heartbeat BIGINT NOT NULL,
            status TEXT NOT NULL DEFAULT '',
            metadata TEXT NOT NULL DEFAULT '{}'
        )"
        .to_string(),
    ];

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_beads_status ON beads (status)",
        "CREATE INDEX IF NOT EXISTS idx_beads_project ON beads (project_id)",
        "CREATE INDEX IF NOT EXISTS idx_beads_assigned ON beads (assigned_to)",
        "CREATE INDEX IF NOT EXISTS idx_agents_status ON agents (status)",
        "CREATE INDEX IF NOT EXISTS idx_agents_project ON agents (project_id)",
        "CREATE INDEX IF NOT EXISTS idx_agents_position ON agents (position_id)",
        "CREATE INDEX IF NOT EXISTS idx_providers_status ON providers (status)",
        "CREATE INDEX IF NOT EXISTS idx_projects_parent ON projects (parent_id)",
        "CREATE INDEX IF NOT EXISTS idx_history_execution ON workflow_execution_history (execution_id)",
        "CREATE INDEX IF NOT EXISTS idx_lessons_project ON lessons (project_id, category)",
        "CREATE INDEX IF NOT EXISTS idx_activity_time ON activity_feed (occurred_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_activity_project ON activity_feed (project_id)",
        "CREATE INDEX IF NOT EXISTS idx_activity_actor ON activity_feed (actor_id)",
        "CREATE INDEX IF NOT EXISTS idx_activity_event ON activity_feed (event_type)",
        "CREATE INDEX IF NOT EXISTS idx_activity_aggregation ON activity_feed (aggregation_key, occurred_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_activity_resource ON activity_feed (resource_type)",
        "CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications (user_id, status, created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_conversations_bead ON conversation_contexts (bead_id)",
        "CREATE INDEX IF NOT EXISTS idx_conversations_expires ON conversation_contexts (expires_at)",
        "CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversation_contexts (updated_at)",
        "CREATE INDEX IF NOT EXISTS idx_conversations_project ON conversation_contexts (project_id)",
        "CREATE INDEX IF NOT EXISTS idx_comments_bead ON comments (bead_id)",
        "CREATE INDEX IF NOT EXISTS idx_mentions_comment ON mentions (comment_id)",
    ];
    ddl.extend(indexes.iter().map(|s| s.to_string()));
    ddl
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_specific_types() {
        let sqlite = statements(Dialect::Sqlite).join("\n");
        let pg = statements(Dialect::Postgres).join("\n");
        assert!(sqlite.contains("AUTOINCREMENT"));
        assert!(!sqlite.contains("BYTEA"));
        assert!(pg.contains("BIGSERIAL"));
        assert!(pg.contains("api_key_encrypted BYTEA"));
        assert!(pg.contains("metrics TEXT NOT NULL DEFAULT '{}'"));
    }
}
