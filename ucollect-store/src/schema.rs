//! Table/column name constants for the relational schema this crate expects
//! (§6: "Persisted state (schema expectations, not exhaustive)"). Kept as
//! plain `&str` constants rather than a query-builder, matching the
//! teacher's `ando-store::schema::Schema`'s role as a thin name registry in
//! front of hand-written queries.

pub const CLIENTS: &str = "clients";
pub const ACTIVITIES: &str = "activities";
pub const ACTIVITY_TYPES: &str = "activity_types";
pub const ACTIVE_PLUGINS: &str = "active_plugins";
pub const PLUGIN_HISTORY: &str = "plugin_history";
pub const KNOWN_PLUGINS: &str = "known_plugins";

/// Diff-address-set tables are per-plugin and configured at runtime (§4.6),
/// so only the expected column names are fixed here, not a table name.
pub mod addr_set_columns {
    pub const EPOCH: &str = "epoch";
    pub const VERSION: &str = "version";
    pub const ADDRESS: &str = "address";
    pub const ADD: &str = "add";
}

/// A table or column name taken from runtime plugin configuration (§4.6) is
/// interpolated directly into SQL text, since `sqlx` has no bind-parameter
/// syntax for identifiers. Reject anything that isn't a plain identifier
/// before it ever reaches a query string.
pub fn validate_identifier(name: &str) -> Result<(), String> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.chars().next().is_some_and(|c| !c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(format!("{name:?} is not a valid SQL identifier"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        assert!(validate_identifier("flow_filters").is_ok());
        assert!(validate_identifier("X1").is_ok());
    }

    #[test]
    fn rejects_identifiers_with_sql_metacharacters() {
        assert!(validate_identifier("flow; DROP TABLE clients;--").is_err());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1table").is_err());
    }
}
