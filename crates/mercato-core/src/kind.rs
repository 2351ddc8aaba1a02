//! Entity kinds handled by the sync engine.

use serde::{Deserialize, Serialize};

/// The kinds of catalog entities that are reconciled between the source
/// and the sink.
///
/// Every kind has its own sync-record table of identical shape, and its
/// own adapter implementing the reconciliation capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Product,
    Category,
    Tag,
    Attribute,
    AttributeValue,
}

impl EntityKind {
    /// All kinds, in dependency order (attributes before products).
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Attribute,
        EntityKind::AttributeValue,
        EntityKind::Category,
        EntityKind::Tag,
        EntityKind::Product,
    ];

    /// Name of the sync-record table for this kind.
    #[must_use]
    pub const fn sync_table(self) -> &'static str {
        match self {
            EntityKind::Product => "product_sync_records",
            EntityKind::Category => "category_sync_records",
            EntityKind::Tag => "tag_sync_records",
            EntityKind::Attribute => "attribute_sync_records",
            EntityKind::AttributeValue => "attribute_value_sync_records",
        }
    }

    /// Stable lowercase name, used in lock keys and log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Category => "category",
            EntityKind::Tag => "tag",
            EntityKind::Attribute => "attribute",
            EntityKind::AttributeValue => "attribute_value",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product" => Ok(EntityKind::Product),
            "category" => Ok(EntityKind::Category),
            "tag" => Ok(EntityKind::Tag),
            "attribute" => Ok(EntityKind::Attribute),
            "attribute_value" => Ok(EntityKind::AttributeValue),
            _ => Err(format!("Unknown entity kind: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_names() {
        for kind in EntityKind::ALL {
            let parsed: EntityKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_tables_are_distinct() {
        let tables: std::collections::HashSet<_> =
            EntityKind::ALL.iter().map(|k| k.sync_table()).collect();
        assert_eq!(tables.len(), EntityKind::ALL.len());
    }
}
