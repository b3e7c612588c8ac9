// SQL query fragments shared by the repositories

/// SQL query fragments for the subscription join
pub mod subscription_queries {
    /// Tracked pair columns. Milestone dates are cast to text so that both DATE
    /// and legacy TEXT columns reach the catalog in the same `YYYY-MM-DD` form.
    pub const SELECT_TRACKED_PAIR_COLUMNS: &str = r#"ue.user_id AS user_id,
        u.email AS contact,
        e.id AS exam_id, e.name AS exam_name, e.institution AS institution,
        e.start_registration::text AS start_registration,
        e.end_registration::text AS end_registration,
        e.payment_deadline::text AS payment_deadline,
        e.exemption_deadline::text AS exemption_deadline,
        e.first_phase_date::text AS first_phase_date,
        e.second_phase_date::text AS second_phase_date,
        e.results_date::text AS results_date,
        e.first_call_date::text AS first_call_date,
        e.enrollment_date::text AS enrollment_date,
        e.second_call_date::text AS second_call_date"#;

    pub const FROM_TRACKED_PAIRS: &str = r#"FROM user_exams ue
        JOIN users u ON u.id = ue.user_id
        JOIN exams e ON e.id = ue.exam_id"#;
}

/// SQL query fragments for the dispatch ledger tables
pub mod dispatch_queries {
    /// Predicate matching one ledger key, bound as $1..$5
    pub const KEY_PREDICATE: &str = r#"user_id = $1 AND exam_id = $2
        AND milestone_kind = $3 AND offset_days = $4 AND milestone_date = $5"#;

    /// All columns for alert_dispatches
    pub const SELECT_ALL_COLUMNS: &str = r#"id, user_id, exam_id, milestone_kind, offset_days,
        milestone_date, recipient, trigger_source, sent_at"#;
}
