use sha2::{Digest, Sha256};

use trailkeep_domain::AuditSchema;

const ROUTINE_PREFIX: &str = "audit_merge_";
const BODY_DELIMITER: &str = "$trailkeep$";

/// Generated PL/pgSQL merge routine for one audit schema.
///
/// The routine takes the whole batch as one `jsonb` payload plus the merge
/// window in seconds and returns the number of records it processed. Its name
/// embeds a digest of the body, so a changed schema never reuses a stale routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStatement {
    routine_name: String,
    body: String,
}

impl MergeStatement {
    /// Generates the routine for the provided schema.
    #[must_use]
    pub fn generate(schema: &AuditSchema) -> Self {
        let body = routine_body(schema);
        let digest = hex::encode(Sha256::digest(body.as_bytes()));
        let routine_name = format!("{ROUTINE_PREFIX}{}", &digest[..8]);

        Self { routine_name, body }
    }

    /// Returns the unqualified routine name.
    #[must_use]
    pub fn routine_name(&self) -> &str {
        self.routine_name.as_str()
    }

    /// Returns the PL/pgSQL body.
    #[must_use]
    pub fn body(&self) -> &str {
        self.body.as_str()
    }

    /// Statement creating the routine in the current schema.
    #[must_use]
    pub fn stored_definition(&self) -> String {
        self.definition(&self.routine_name)
    }

    /// Statement creating the routine in the session's temporary schema.
    #[must_use]
    pub fn session_definition(&self) -> String {
        self.definition(&format!("pg_temp.{}", self.routine_name))
    }

    /// Statement invoking the stored routine.
    #[must_use]
    pub fn stored_call(&self) -> String {
        call(&self.routine_name)
    }

    /// Statement invoking the session-scoped routine.
    #[must_use]
    pub fn session_call(&self) -> String {
        call(&format!("pg_temp.{}", self.routine_name))
    }

    /// Cache weight in bytes of generated text.
    #[must_use]
    pub fn weight(&self) -> u32 {
        u32::try_from(self.body.len() + self.routine_name.len()).unwrap_or(u32::MAX)
    }

    fn definition(&self, qualified_name: &str) -> String {
        format!(
            "CREATE OR REPLACE FUNCTION {qualified_name}(payload jsonb, merge_window_seconds double precision)\n\
             RETURNS integer\n\
             LANGUAGE plpgsql\n\
             AS {BODY_DELIMITER}\n{}\n{BODY_DELIMITER}",
            self.body
        )
    }
}

fn call(qualified_name: &str) -> String {
    format!("SELECT {qualified_name}($1::jsonb, $2::double precision)")
}

fn routine_body(schema: &AuditSchema) -> String {
    let describes = schema.shape().has_descriptions();
    let records = schema.record_table().qualified();
    let properties = schema.property_table().qualified();
    let extras = schema.enrichment_columns();

    let mut incoming_columns = vec![
        "\"type\" text".to_owned(),
        "\"key_value\" text".to_owned(),
    ];
    if describes {
        incoming_columns.push("\"description\" text".to_owned());
    }
    incoming_columns.push("\"state\" smallint".to_owned());
    incoming_columns.push("\"timestamp\" timestamptz".to_owned());
    for column in extras {
        incoming_columns.push(format!(
            "{} {}",
            column.quoted(),
            column.store_type().as_sql()
        ));
    }
    incoming_columns.push("\"properties\" jsonb".to_owned());

    let mut property_columns = vec![
        "\"field_name\" text".to_owned(),
        "\"old_value\" text".to_owned(),
    ];
    if describes {
        property_columns.push("\"old_value_description\" text".to_owned());
    }
    property_columns.push("\"new_value\" text".to_owned());
    if describes {
        property_columns.push("\"new_value_description\" text".to_owned());
    }
    let property_columns = property_columns.join(", ");
    let property_names = schema.property_columns()[2..]
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>();
    let property_values = schema.property_columns()[2..]
        .iter()
        .map(|name| format!("c.\"{name}\""))
        .collect::<Vec<_>>()
        .join(", ");

    let mut declarations = vec![
        "incoming record;".to_owned(),
        "target_id bigint;".to_owned(),
        "existing_id bigint;".to_owned(),
        "existing_state smallint;".to_owned(),
        "existing_timestamp timestamptz;".to_owned(),
        "existing_fields text;".to_owned(),
        "incoming_fields text;".to_owned(),
        "processed integer := 0;".to_owned(),
    ];
    if describes {
        declarations.push("existing_description text;".to_owned());
    }

    let mut existing_columns = vec![
        "r.\"id\"".to_owned(),
        "r.\"state\"".to_owned(),
        "r.\"timestamp\"".to_owned(),
    ];
    let mut existing_targets = vec![
        "existing_id".to_owned(),
        "existing_state".to_owned(),
        "existing_timestamp".to_owned(),
    ];
    let mut match_conditions =
        vec!["existing_state IS NOT DISTINCT FROM incoming.\"state\"".to_owned()];
    if describes {
        existing_columns.push("r.\"description\"".to_owned());
        existing_targets.push("existing_description".to_owned());
        match_conditions.push(
            "existing_description IS NOT DISTINCT FROM incoming.\"description\"".to_owned(),
        );
    }
    for (index, column) in extras.iter().enumerate() {
        declarations.push(format!(
            "existing_extra_{index} {};",
            column.store_type().as_sql()
        ));
        existing_columns.push(format!("r.{}", column.quoted()));
        existing_targets.push(format!("existing_extra_{index}"));
        match_conditions.push(format!(
            "existing_extra_{index} IS NOT DISTINCT FROM incoming.{}",
            column.quoted()
        ));
    }
    match_conditions.push(
        "incoming.\"timestamp\" - existing_timestamp < make_interval(secs => merge_window_seconds)"
            .to_owned(),
    );
    match_conditions.push("incoming.\"timestamp\" >= existing_timestamp".to_owned());
    match_conditions.push("existing_fields IS NOT DISTINCT FROM incoming_fields".to_owned());

    let mut new_value_assignments = vec!["\"new_value\" = c.\"new_value\"".to_owned()];
    if describes {
        new_value_assignments
            .push("\"new_value_description\" = c.\"new_value_description\"".to_owned());
    }

    let mut record_names = vec!["\"type\"".to_owned(), "\"key_value\"".to_owned()];
    let mut record_values = vec![
        "incoming.\"type\"".to_owned(),
        "incoming.\"key_value\"".to_owned(),
    ];
    if describes {
        record_names.push("\"description\"".to_owned());
        record_values.push("incoming.\"description\"".to_owned());
    }
    record_names.push("\"state\"".to_owned());
    record_values.push("incoming.\"state\"".to_owned());
    record_names.push("\"timestamp\"".to_owned());
    record_values.push("incoming.\"timestamp\"".to_owned());
    for column in extras {
        record_names.push(column.quoted());
        record_values.push(format!("incoming.{}", column.quoted()));
    }

    let property_insert_names = std::iter::once("\"parent_id\"".to_owned())
        .chain(property_names)
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"#variable_conflict use_column
DECLARE
    {declarations}
BEGIN
    FOR incoming IN
        SELECT *
        FROM jsonb_to_recordset(payload) AS entry({incoming_columns})
    LOOP
        existing_id := NULL;
        existing_fields := NULL;
        incoming_fields := NULL;

        IF incoming."type" IS NOT NULL AND incoming."key_value" IS NOT NULL THEN
            SELECT {existing_columns}
            INTO {existing_targets}
            FROM {records} AS r
            WHERE r."type" = incoming."type"
                AND r."key_value" = incoming."key_value"
            ORDER BY r."id" DESC
            LIMIT 1;
        END IF;

        IF existing_id IS NOT NULL THEN
            SELECT string_agg(p."field_name", ',' ORDER BY p."field_name")
            INTO existing_fields
            FROM {properties} AS p
            WHERE p."parent_id" = existing_id;

            SELECT string_agg(c."field_name", ',' ORDER BY c."field_name")
            INTO incoming_fields
            FROM jsonb_to_recordset(incoming."properties") AS c("field_name" text);
        END IF;

        IF existing_id IS NOT NULL
            AND {match_conditions}
        THEN
            target_id := existing_id;

            UPDATE {records}
            SET "timestamp" = incoming."timestamp"
            WHERE "id" = target_id;

            UPDATE {properties} AS p
            SET {new_value_assignments}
            FROM jsonb_to_recordset(incoming."properties") AS c({property_columns})
            WHERE p."parent_id" = target_id
                AND p."field_name" = c."field_name";

            INSERT INTO {properties} ({property_insert_names})
            SELECT target_id, {property_values}
            FROM jsonb_to_recordset(incoming."properties") AS c({property_columns})
            WHERE NOT EXISTS (
                SELECT 1
                FROM {properties} AS p
                WHERE p."parent_id" = target_id
                    AND p."field_name" = c."field_name"
            );
        ELSE
            INSERT INTO {records} ({record_names})
            VALUES ({record_values})
            RETURNING "id" INTO target_id;

            INSERT INTO {properties} ({property_insert_names})
            SELECT target_id, {property_values}
            FROM jsonb_to_recordset(incoming."properties") AS c({property_columns});
        END IF;

        processed := processed + 1;
    END LOOP;

    RETURN processed;
END;"#,
        declarations = declarations.join("\n    "),
        incoming_columns = incoming_columns.join(", "),
        existing_columns = existing_columns.join(", "),
        existing_targets = existing_targets.join(", "),
        match_conditions = match_conditions.join("\n            AND "),
        new_value_assignments = new_value_assignments.join(", "),
        record_names = record_names.join(", "),
        record_values = record_values.join(", "),
    )
}
