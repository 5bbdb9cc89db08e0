use chrono::TimeDelta;

use crate::audit_log::AuditLogRecord;
use crate::schema::AuditSchema;

/// Decides whether `incoming` may extend `existing`, the newest stored record
/// for the same entity type and key.
///
/// All of the following must hold:
/// - the incoming type is non-empty and its key is present;
/// - state, description (when the shape stores one) and every enrichment column
///   are equal or absent on both sides;
/// - less than `window` elapsed between the two timestamps;
/// - the incoming timestamp is not earlier than the existing one;
/// - both records touch exactly the same set of fields.
#[must_use]
pub fn can_extend(
    existing: &AuditLogRecord,
    incoming: &AuditLogRecord,
    schema: &AuditSchema,
    window: TimeDelta,
) -> bool {
    if incoming.entity_type.is_empty() || incoming.key_value.is_none() {
        return false;
    }

    if existing.entity_type != incoming.entity_type || existing.key_value != incoming.key_value {
        return false;
    }

    if existing.state != incoming.state {
        return false;
    }

    if schema.shape().has_descriptions() && existing.description != incoming.description {
        return false;
    }

    if !existing
        .context
        .matches_on(&incoming.context, schema.enrichment_columns())
    {
        return false;
    }

    let elapsed = incoming.timestamp - existing.timestamp;
    if elapsed >= window || elapsed < TimeDelta::zero() {
        return false;
    }

    existing.sorted_field_names() == incoming.sorted_field_names()
}
