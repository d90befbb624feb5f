//! redb table definitions for the autoscale store.

use redb::TableDefinition;

/// Active request records keyed by `{project}:{service}:{version}`.
pub const ACTIVE_REQUESTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("active_requests");
