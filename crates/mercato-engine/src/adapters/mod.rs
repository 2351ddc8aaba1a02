//! Per-kind reconciliation adapters.
//!
//! Each adapter implements [`crate::reconciler::EntityAdapter`] for one
//! entity kind: how to fetch, search, create and update that kind in
//! the sink, and how to map normalized source fields onto the sink's
//! document shape.

pub mod attribute;
pub mod category;
pub mod product;
pub mod tag;

pub use attribute::{AttributeAdapter, AttributeValueAdapter};
pub use category::CategoryAdapter;
pub use product::ProductAdapter;
pub use tag::TagAdapter;

/// Build a URL-safe slug from an entity name.
///
/// Lowercases, maps runs of non-alphanumerics to single dashes and
/// trims dangling dashes.
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Office Desk"), "office-desk");
    }

    #[test]
    fn test_slugify_collapses_punctuation() {
        assert_eq!(slugify("Desk  --  (Oak, 140cm)"), "desk-oak-140cm");
    }

    #[test]
    fn test_slugify_trims_edges() {
        assert_eq!(slugify("  Desk!  "), "desk");
    }
}
