//! Price computation engine.
//!
//! Evaluates the source system's pricing rules in-memory and emits
//! sink-ready price fields. The evaluation reproduces the source's
//! semantics exactly: rule specificity, quantity breaks, chained price
//! lists and formula margins.

use chrono::{DateTime, Utc};
use mercato_db::{PriceType, PricelistBinding};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::warn;

/// What a rule applies to, from most to least specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceRuleScope {
    /// One exact product variant.
    Variant(i64),
    /// All variants of one product template.
    Template(i64),
    /// All products in one category.
    Category(i64),
    /// Every product.
    Global,
}

impl PriceRuleScope {
    /// Specificity rank; lower wins.
    fn rank(self) -> u8 {
        match self {
            PriceRuleScope::Variant(_) => 0,
            PriceRuleScope::Template(_) => 1,
            PriceRuleScope::Category(_) => 2,
            PriceRuleScope::Global => 3,
        }
    }

    fn matches(self, product: &ProductPricing) -> bool {
        match self {
            PriceRuleScope::Variant(id) => product.variant_id == id,
            PriceRuleScope::Template(id) => product.template_id == id,
            PriceRuleScope::Category(id) => product.category_id == Some(id),
            PriceRuleScope::Global => true,
        }
    }
}

/// Which amount a rule starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceBase {
    /// The product's list price.
    ListPrice,
    /// The product's cost.
    StandardPrice,
    /// The result of another price list (chained evaluation).
    Pricelist(i64),
}

/// How the final amount is derived from the base.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceCompute {
    /// A literal amount, ignoring the base.
    Fixed(f64),
    /// `base * (1 + pct/100)`; negative pct is a discount.
    Percentage(f64),
    /// `base * (1 + pct/100) + surcharge`, clamped into
    /// `[cost + min_margin, cost + max_margin]` where configured.
    Formula {
        pct: f64,
        surcharge: f64,
        min_margin: Option<f64>,
        max_margin: Option<f64>,
    },
}

/// One pricing rule of one price list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRule {
    pub id: i64,
    pub pricelist_id: i64,
    pub scope: PriceRuleScope,
    /// Quantity break: the rule applies from this quantity upward.
    pub min_quantity: f64,
    pub base: PriceBase,
    pub compute: PriceCompute,
    pub date_start: Option<DateTime<Utc>>,
    pub date_end: Option<DateTime<Utc>>,
}

impl PriceRule {
    fn applies(&self, product: &ProductPricing, quantity: f64, date: DateTime<Utc>) -> bool {
        if !self.scope.matches(product) {
            return false;
        }
        if self.min_quantity > quantity {
            return false;
        }
        if let Some(start) = self.date_start {
            if date < start {
                return false;
            }
        }
        if let Some(end) = self.date_end {
            if date > end {
                return false;
            }
        }
        true
    }

    /// Parse a rule from a normalized source record.
    ///
    /// Returns `None` for records missing the fields that make a rule
    /// evaluable. The source expresses percentage and formula discounts
    /// as positive percentages to subtract; they are negated here so a
    /// discount is a negative `pct` throughout the engine.
    #[must_use]
    pub fn from_source(record: &Value) -> Option<Self> {
        let id = record.get("id")?.as_i64()?;
        let pricelist_id = record.get("pricelist_id")?.as_i64()?;

        let scope = match record.get("applied_on").and_then(Value::as_str)? {
            "0_product_variant" => PriceRuleScope::Variant(record.get("product_id")?.as_i64()?),
            "1_product" => PriceRuleScope::Template(record.get("product_tmpl_id")?.as_i64()?),
            "2_product_category" => PriceRuleScope::Category(record.get("categ_id")?.as_i64()?),
            _ => PriceRuleScope::Global,
        };

        let base = match record.get("base").and_then(Value::as_str) {
            Some("standard_price") => PriceBase::StandardPrice,
            Some("pricelist") => PriceBase::Pricelist(record.get("base_pricelist_id")?.as_i64()?),
            _ => PriceBase::ListPrice,
        };

        let num = |key: &str| record.get(key).and_then(Value::as_f64);
        let compute = match record.get("compute_price").and_then(Value::as_str)? {
            "fixed" => PriceCompute::Fixed(num("fixed_price").unwrap_or(0.0)),
            "percentage" => PriceCompute::Percentage(-num("percent_price").unwrap_or(0.0)),
            "formula" => PriceCompute::Formula {
                pct: -num("price_discount").unwrap_or(0.0),
                surcharge: num("price_surcharge").unwrap_or(0.0),
                min_margin: num("price_min_margin").filter(|m| *m != 0.0),
                max_margin: num("price_max_margin").filter(|m| *m != 0.0),
            },
            _ => return None,
        };

        Some(Self {
            id,
            pricelist_id,
            scope,
            min_quantity: num("min_quantity").unwrap_or(0.0),
            base,
            compute,
            date_start: record
                .get("date_start")
                .and_then(Value::as_str)
                .and_then(crate::classifier::parse_source_datetime),
            date_end: record
                .get("date_end")
                .and_then(Value::as_str)
                .and_then(crate::classifier::parse_source_datetime),
        })
    }
}

/// Pricing-relevant fields of one product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductPricing {
    pub variant_id: i64,
    pub template_id: i64,
    pub category_id: Option<i64>,
    /// Base list price.
    pub list_price: f64,
    /// Cost, used by `standard_price` bases and margin clamps.
    pub standard_price: f64,
}

/// Sink-ready price fields produced per active binding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceFields {
    pub regular_price: Option<String>,
    pub sale_price: Option<String>,
    pub meta_data: Vec<(String, String)>,
}

impl PriceFields {
    /// Whether any field was produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regular_price.is_none() && self.sale_price.is_none() && self.meta_data.is_empty()
    }

    /// Serialize as the sink's product-update payload fragment.
    #[must_use]
    pub fn to_sink_payload(&self) -> Value {
        let mut payload = serde_json::Map::new();
        if let Some(regular) = &self.regular_price {
            payload.insert("regular_price".to_string(), Value::String(regular.clone()));
        }
        if let Some(sale) = &self.sale_price {
            payload.insert("sale_price".to_string(), Value::String(sale.clone()));
        }
        if !self.meta_data.is_empty() {
            let meta: Vec<Value> = self
                .meta_data
                .iter()
                .map(|(key, value)| serde_json::json!({"key": key, "value": value}))
                .collect();
            payload.insert("meta_data".to_string(), Value::Array(meta));
        }
        Value::Object(payload)
    }
}

/// Rule evaluator over one tenant's pricing rules.
#[derive(Debug, Clone, Default)]
pub struct PriceEngine {
    rules: Vec<PriceRule>,
}

impl PriceEngine {
    #[must_use]
    pub fn new(rules: Vec<PriceRule>) -> Self {
        Self { rules }
    }

    /// Compute the effective price of a product on one price list.
    ///
    /// No price list or no matching rule falls back to the product's
    /// list price — never an error. The result is floored at zero and
    /// rounded to 2 decimal places.
    #[must_use]
    pub fn compute(
        &self,
        product: &ProductPricing,
        pricelist_id: Option<i64>,
        quantity: f64,
        date: DateTime<Utc>,
    ) -> f64 {
        let price = match pricelist_id {
            Some(pricelist_id) => {
                let mut visited = HashSet::new();
                self.compute_inner(product, pricelist_id, quantity, date, &mut visited)
            }
            None => product.list_price,
        };
        round2(price.max(0.0))
    }

    fn compute_inner(
        &self,
        product: &ProductPricing,
        pricelist_id: i64,
        quantity: f64,
        date: DateTime<Utc>,
        visited: &mut HashSet<i64>,
    ) -> f64 {
        // Chained price lists must not loop: revisiting a list falls
        // back to the list price.
        if !visited.insert(pricelist_id) {
            warn!(
                pricelist_id = pricelist_id,
                "Cyclic price list reference, falling back to list price"
            );
            return product.list_price;
        }

        let Some(rule) = self.match_rule(product, pricelist_id, quantity, date) else {
            return product.list_price;
        };

        let base = match rule.base {
            PriceBase::ListPrice => product.list_price,
            PriceBase::StandardPrice => product.standard_price,
            PriceBase::Pricelist(other) => {
                self.compute_inner(product, other, quantity, date, visited)
            }
        };

        match rule.compute {
            PriceCompute::Fixed(amount) => amount,
            PriceCompute::Percentage(pct) => base * (1.0 + pct / 100.0),
            PriceCompute::Formula {
                pct,
                surcharge,
                min_margin,
                max_margin,
            } => {
                let mut price = base * (1.0 + pct / 100.0) + surcharge;
                if let Some(min_margin) = min_margin {
                    price = price.max(product.standard_price + min_margin);
                }
                if let Some(max_margin) = max_margin {
                    price = price.min(product.standard_price + max_margin);
                }
                price
            }
        }
    }

    /// Pick the applicable rule with the highest specificity, tie-broken
    /// by the highest satisfied quantity break, then by lowest rule id.
    fn match_rule(
        &self,
        product: &ProductPricing,
        pricelist_id: i64,
        quantity: f64,
        date: DateTime<Utc>,
    ) -> Option<&PriceRule> {
        self.rules
            .iter()
            .filter(|rule| rule.pricelist_id == pricelist_id)
            .filter(|rule| rule.applies(product, quantity, date))
            .min_by(|a, b| {
                a.scope
                    .rank()
                    .cmp(&b.scope.rank())
                    .then_with(|| {
                        b.min_quantity
                            .partial_cmp(&a.min_quantity)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| a.id.cmp(&b.id))
            })
    }

    /// Compute the sink-ready price fields for a product across the
    /// tenant's active bindings.
    #[must_use]
    pub fn price_fields(
        &self,
        product: &ProductPricing,
        bindings: &[PricelistBinding],
        quantity: f64,
        date: DateTime<Utc>,
    ) -> PriceFields {
        let mut fields = PriceFields::default();
        for binding in bindings {
            let price = self.compute(
                product,
                Some(binding.source_pricelist_id),
                quantity,
                date,
            );
            let formatted = format!("{price:.2}");
            match binding.price_type {
                PriceType::Regular => fields.regular_price = Some(formatted),
                PriceType::Sale => fields.sale_price = Some(formatted),
                PriceType::Meta => {
                    if let Some(meta_key) = &binding.meta_key {
                        fields.meta_data.push((meta_key.clone(), formatted));
                    }
                }
            }
        }
        fields
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product() -> ProductPricing {
        ProductPricing {
            variant_id: 11,
            template_id: 5,
            category_id: Some(3),
            list_price: 100.0,
            standard_price: 50.0,
        }
    }

    fn rule(id: i64, pricelist_id: i64, scope: PriceRuleScope, compute: PriceCompute) -> PriceRule {
        PriceRule {
            id,
            pricelist_id,
            scope,
            min_quantity: 0.0,
            base: PriceBase::ListPrice,
            compute,
            date_start: None,
            date_end: None,
        }
    }

    #[test]
    fn test_no_pricelist_returns_list_price() {
        let engine = PriceEngine::new(vec![]);
        assert_eq!(engine.compute(&product(), None, 1.0, Utc::now()), 100.0);
    }

    #[test]
    fn test_no_matching_rule_falls_back_to_list_price() {
        let engine = PriceEngine::new(vec![rule(
            1,
            99,
            PriceRuleScope::Global,
            PriceCompute::Fixed(1.0),
        )]);
        assert_eq!(engine.compute(&product(), Some(2), 1.0, Utc::now()), 100.0);
    }

    #[test]
    fn test_fixed_rule() {
        let engine = PriceEngine::new(vec![rule(
            1,
            2,
            PriceRuleScope::Global,
            PriceCompute::Fixed(80.0),
        )]);
        assert_eq!(engine.compute(&product(), Some(2), 1.0, Utc::now()), 80.00);
    }

    #[test]
    fn test_percentage_discount() {
        let engine = PriceEngine::new(vec![rule(
            1,
            2,
            PriceRuleScope::Global,
            PriceCompute::Percentage(-10.0),
        )]);
        assert_eq!(engine.compute(&product(), Some(2), 1.0, Utc::now()), 90.00);
    }

    #[test]
    fn test_formula_with_min_margin_clamp() {
        // Naive result 100 * 0.4 = 40, clamped up to cost + margin = 70.
        let engine = PriceEngine::new(vec![rule(
            1,
            2,
            PriceRuleScope::Global,
            PriceCompute::Formula {
                pct: -60.0,
                surcharge: 0.0,
                min_margin: Some(20.0),
                max_margin: None,
            },
        )]);
        assert_eq!(engine.compute(&product(), Some(2), 1.0, Utc::now()), 70.00);
    }

    #[test]
    fn test_formula_with_max_margin_clamp() {
        // Naive result 100 * 1.5 = 150, clamped down to cost + 60 = 110.
        let engine = PriceEngine::new(vec![rule(
            1,
            2,
            PriceRuleScope::Global,
            PriceCompute::Formula {
                pct: 50.0,
                surcharge: 0.0,
                min_margin: None,
                max_margin: Some(60.0),
            },
        )]);
        assert_eq!(engine.compute(&product(), Some(2), 1.0, Utc::now()), 110.00);
    }

    #[test]
    fn test_result_floored_at_zero() {
        let engine = PriceEngine::new(vec![rule(
            1,
            2,
            PriceRuleScope::Global,
            PriceCompute::Percentage(-150.0),
        )]);
        assert_eq!(engine.compute(&product(), Some(2), 1.0, Utc::now()), 0.00);
    }

    #[test]
    fn test_variant_rule_beats_global() {
        let engine = PriceEngine::new(vec![
            rule(1, 2, PriceRuleScope::Global, PriceCompute::Fixed(90.0)),
            rule(2, 2, PriceRuleScope::Variant(11), PriceCompute::Fixed(85.0)),
            rule(3, 2, PriceRuleScope::Template(5), PriceCompute::Fixed(88.0)),
        ]);
        assert_eq!(engine.compute(&product(), Some(2), 1.0, Utc::now()), 85.00);
    }

    #[test]
    fn test_category_rule_beats_global() {
        let engine = PriceEngine::new(vec![
            rule(1, 2, PriceRuleScope::Global, PriceCompute::Fixed(90.0)),
            rule(2, 2, PriceRuleScope::Category(3), PriceCompute::Fixed(70.0)),
        ]);
        assert_eq!(engine.compute(&product(), Some(2), 1.0, Utc::now()), 70.00);
    }

    #[test]
    fn test_quantity_break_tie_breaks_to_highest_satisfied() {
        let mut cheap = rule(1, 2, PriceRuleScope::Global, PriceCompute::Fixed(60.0));
        cheap.min_quantity = 10.0;
        let standard = rule(2, 2, PriceRuleScope::Global, PriceCompute::Fixed(90.0));

        let engine = PriceEngine::new(vec![standard, cheap]);
        assert_eq!(engine.compute(&product(), Some(2), 5.0, Utc::now()), 90.00);
        assert_eq!(engine.compute(&product(), Some(2), 10.0, Utc::now()), 60.00);
    }

    #[test]
    fn test_equal_rules_tie_break_by_id() {
        let engine = PriceEngine::new(vec![
            rule(7, 2, PriceRuleScope::Global, PriceCompute::Fixed(75.0)),
            rule(3, 2, PriceRuleScope::Global, PriceCompute::Fixed(65.0)),
        ]);
        assert_eq!(engine.compute(&product(), Some(2), 1.0, Utc::now()), 65.00);
    }

    #[test]
    fn test_chained_pricelist_base() {
        // List 3 discounts 10% off the result of list 2, which is fixed 80.
        let engine = PriceEngine::new(vec![
            rule(1, 2, PriceRuleScope::Global, PriceCompute::Fixed(80.0)),
            PriceRule {
                base: PriceBase::Pricelist(2),
                ..rule(2, 3, PriceRuleScope::Global, PriceCompute::Percentage(-10.0))
            },
        ]);
        assert_eq!(engine.compute(&product(), Some(3), 1.0, Utc::now()), 72.00);
    }

    #[test]
    fn test_cyclic_pricelist_falls_back_to_list_price() {
        let engine = PriceEngine::new(vec![
            PriceRule {
                base: PriceBase::Pricelist(3),
                ..rule(1, 2, PriceRuleScope::Global, PriceCompute::Percentage(-10.0))
            },
            PriceRule {
                base: PriceBase::Pricelist(2),
                ..rule(2, 3, PriceRuleScope::Global, PriceCompute::Percentage(-10.0))
            },
        ]);
        // 2 → 3 → 2 cycle: inner lookup fails closed to the list price,
        // the outer discount still applies.
        assert_eq!(engine.compute(&product(), Some(2), 1.0, Utc::now()), 81.00);
    }

    #[test]
    fn test_self_referencing_pricelist() {
        let engine = PriceEngine::new(vec![PriceRule {
            base: PriceBase::Pricelist(2),
            ..rule(1, 2, PriceRuleScope::Global, PriceCompute::Percentage(-10.0))
        }]);
        assert_eq!(engine.compute(&product(), Some(2), 1.0, Utc::now()), 90.00);
    }

    #[test]
    fn test_date_window() {
        let mut seasonal = rule(1, 2, PriceRuleScope::Global, PriceCompute::Fixed(50.0));
        seasonal.date_start = crate::classifier::parse_source_datetime("2024-06-01 00:00:00");
        seasonal.date_end = crate::classifier::parse_source_datetime("2024-06-30 23:59:59");
        let engine = PriceEngine::new(vec![seasonal]);

        let inside = crate::classifier::parse_source_datetime("2024-06-15 12:00:00").unwrap();
        let outside = crate::classifier::parse_source_datetime("2024-07-15 12:00:00").unwrap();
        assert_eq!(engine.compute(&product(), Some(2), 1.0, inside), 50.00);
        assert_eq!(engine.compute(&product(), Some(2), 1.0, outside), 100.00);
    }

    #[test]
    fn test_standard_price_base() {
        let engine = PriceEngine::new(vec![PriceRule {
            base: PriceBase::StandardPrice,
            ..rule(1, 2, PriceRuleScope::Global, PriceCompute::Percentage(20.0))
        }]);
        // cost 50 marked up 20%.
        assert_eq!(engine.compute(&product(), Some(2), 1.0, Utc::now()), 60.00);
    }

    #[test]
    fn test_from_source_fixed() {
        let record = json!({
            "id": 1,
            "pricelist_id": 2,
            "applied_on": "3_global",
            "min_quantity": 0,
            "compute_price": "fixed",
            "fixed_price": 80.0,
            "base": "list_price",
        });
        let rule = PriceRule::from_source(&record).unwrap();
        assert_eq!(rule.compute, PriceCompute::Fixed(80.0));
        assert_eq!(rule.scope, PriceRuleScope::Global);
    }

    #[test]
    fn test_from_source_negates_discounts() {
        let record = json!({
            "id": 1,
            "pricelist_id": 2,
            "applied_on": "0_product_variant",
            "product_id": 11,
            "compute_price": "percentage",
            "percent_price": 10.0,
        });
        let rule = PriceRule::from_source(&record).unwrap();
        assert_eq!(rule.compute, PriceCompute::Percentage(-10.0));
        assert_eq!(rule.scope, PriceRuleScope::Variant(11));
    }

    #[test]
    fn test_from_source_rejects_unknown_compute() {
        let record = json!({
            "id": 1,
            "pricelist_id": 2,
            "applied_on": "3_global",
            "compute_price": "mystery",
        });
        assert!(PriceRule::from_source(&record).is_none());
    }

    #[test]
    fn test_price_fields_per_binding() {
        use uuid::Uuid;

        let engine = PriceEngine::new(vec![
            rule(1, 2, PriceRuleScope::Global, PriceCompute::Fixed(100.0)),
            rule(2, 3, PriceRuleScope::Global, PriceCompute::Fixed(80.0)),
        ]);

        let binding = |pricelist: i64, price_type: PriceType, meta_key: Option<&str>| {
            PricelistBinding {
                id: Uuid::new_v4(),
                tenant_id: Uuid::new_v4(),
                source_pricelist_id: pricelist,
                name: format!("list-{pricelist}"),
                price_type,
                meta_key: meta_key.map(ToString::to_string),
                active: true,
                last_synced_at: None,
                sync_error: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }
        };

        let fields = engine.price_fields(
            &product(),
            &[
                binding(2, PriceType::Regular, None),
                binding(3, PriceType::Sale, None),
                binding(3, PriceType::Meta, Some("wholesale_price")),
            ],
            1.0,
            Utc::now(),
        );

        assert_eq!(fields.regular_price.as_deref(), Some("100.00"));
        assert_eq!(fields.sale_price.as_deref(), Some("80.00"));
        assert_eq!(
            fields.meta_data,
            vec![("wholesale_price".to_string(), "80.00".to_string())]
        );

        let payload = fields.to_sink_payload();
        assert_eq!(payload["regular_price"], "100.00");
        assert_eq!(payload["meta_data"][0]["key"], "wholesale_price");
    }

    #[test]
    fn test_rounding_to_two_decimals() {
        let engine = PriceEngine::new(vec![rule(
            1,
            2,
            PriceRuleScope::Global,
            PriceCompute::Percentage(-33.333),
        )]);
        assert_eq!(engine.compute(&product(), Some(2), 1.0, Utc::now()), 66.67);
    }
}
