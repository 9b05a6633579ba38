//! Declarative pricing rules over the activity-option tree.
//!
//! A pricing rule is a newline-separated list of cases:
//!
//! ```text
//! [opt1, opt2, ...] -> PRICE ["comment"] [<slug>]
//! ```
//!
//! Each option is a path `/a/b/...`, optionally rooted at an activity as
//! `//<act_pk|self>/a/b/...`. A case matches a set of held options when
//! every one of its criteria contains at least one held option, where
//! containment is strict ancestry: a held option satisfies the criteria on
//! its ancestor path, never a criterion equal to itself. The first
//! matching case wins; otherwise the rule's default applies.

use std::collections::HashMap;

use regex::Regex;
use rust_decimal::Decimal;
use thiserror::Error;

use shared::money::Money;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PricingError {
    #[error("line {line}: {text:?} does not constitute a valid pricing rule case")]
    MalformedCase { line: usize, text: String },

    #[error("line {line}: {option:?} is not a valid option path")]
    UnknownOption { line: usize, option: String },
}

/// Handle into the option registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OptionId(usize);

#[derive(Debug)]
struct OptionNode {
    slug: String,
    parent: Option<OptionId>,
    act_ref: Option<i32>,
}

/// Arena of activity options, keyed by `(path, activity)`.
///
/// The registry is focused on one activity; unrooted paths and `//self`
/// paths attach to the focus.
#[derive(Debug, Default)]
pub struct ActivityOptionRegistry {
    nodes: Vec<OptionNode>,
    by_key: HashMap<(String, Option<i32>), OptionId>,
    focus: Option<i32>,
}

impl ActivityOptionRegistry {
    pub fn new(focus: Option<i32>) -> Self {
        Self {
            focus,
            ..Self::default()
        }
    }

    fn path_pattern() -> Regex {
        Regex::new(r"^(//(?P<act_ref>(\d+|self)))?(?P<comps>(/[-a-zA-Z0-9]+)+)$").unwrap()
    }

    fn register(&mut self, path: &str, act_ref: Option<i32>) -> OptionId {
        let (parent, slug) = match path.rfind('/') {
            Some(0) if path.len() > 1 => (None, &path[1..]),
            Some(cut) => (Some((&path[..cut]).to_string()), &path[cut + 1..]),
            _ => (None, ""),
        };
        let parent_id = parent.map(|p| self.ensure_registered_path(&p, act_ref));
        let id = OptionId(self.nodes.len());
        self.nodes.push(OptionNode {
            slug: slug.to_string(),
            parent: parent_id,
            act_ref,
        });
        self.by_key.insert((path.to_string(), act_ref), id);
        id
    }

    fn ensure_registered_path(&mut self, path: &str, act_ref: Option<i32>) -> OptionId {
        if let Some(id) = self.by_key.get(&(path.to_string(), act_ref)) {
            *id
        } else {
            self.register(path, act_ref)
        }
    }

    /// Register (or look up) an option by its textual path, rooted or not.
    /// Returns `None` when the path is not a valid option path.
    pub fn ensure_registered(&mut self, item: &str) -> Option<OptionId> {
        let (path, act_ref) = self.parse_item(item)?;
        Some(self.ensure_registered_path(&path, act_ref))
    }

    /// Look up an already-registered option.
    pub fn get(&self, item: &str) -> Option<OptionId> {
        let (path, act_ref) = self.parse_item(item)?;
        self.by_key.get(&(path, act_ref)).copied()
    }

    fn parse_item(&self, item: &str) -> Option<(String, Option<i32>)> {
        let m = Self::path_pattern().captures(item.trim())?;
        let act_ref = match m.name("act_ref").map(|v| v.as_str()) {
            None | Some("self") => self.focus,
            Some(digits) => digits.parse::<i32>().ok(),
        };
        let path = m.name("comps").map(|v| v.as_str().to_string())?;
        Some((path, act_ref))
    }

    pub fn act_ref(&self, id: OptionId) -> Option<i32> {
        self.nodes[id.0].act_ref
    }

    /// Reconstruct the textual component path of an option.
    pub fn path(&self, id: OptionId) -> String {
        let node = &self.nodes[id.0];
        match node.parent {
            Some(parent) => format!("{}/{}", self.path(parent), node.slug),
            None => format!("/{}", node.slug),
        }
    }

    /// `criterion` contains `option` when it is a strict ancestor of it;
    /// an option never satisfies a criterion equal to itself.
    pub fn contains(&self, criterion: OptionId, option: OptionId) -> bool {
        let mut cursor = self.nodes[option.0].parent;
        while let Some(id) = cursor {
            if id == criterion {
                return true;
            }
            cursor = self.nodes[id.0].parent;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// The outcome of evaluating a rule against a set of held options.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingData {
    pub price: Money,
    pub comment: String,
    pub filter_slug: Option<String>,
}

/// A parsed pricing rule: ordered cases plus defaults.
#[derive(Debug)]
pub struct PricingRule {
    pub description: String,
    pub default_filter_slug: Option<String>,
    pub no_match_default: Money,
    /// Declared multiplicity flag; carried as data, not consulted by the
    /// matcher.
    pub count_multiple: bool,
    cases: Vec<(Vec<OptionId>, PricingData)>,
    relevant_activities: Vec<Option<i32>>,
}

impl PricingRule {
    fn case_pattern() -> Regex {
        Regex::new(
            r#"^\[(?P<match_options>[-/,a-zA-Z0-9\s]*)\]\s*->\s*(?P<price>\d+([.,]\d{1,2})?)\s*("(?P<comment>.*?)")?\s*(<(?P<filter_slug>[-_a-zA-Z0-9]+)>)?\s*$"#,
        )
        .unwrap()
    }

    /// Parse a rule specification. Any malformed line or unknown option
    /// path is fatal to the whole rule.
    pub fn parse(
        specification: &str,
        description: &str,
        default_filter_slug: Option<&str>,
        no_match_default: Money,
        count_multiple: bool,
        registry: &mut ActivityOptionRegistry,
    ) -> Result<Self, PricingError> {
        let pattern = Self::case_pattern();
        let currency = no_match_default.currency();
        let mut cases = Vec::new();
        let mut relevant_activities = Vec::new();

        for (index, raw_line) in specification.lines().enumerate() {
            let line_no = index + 1;
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            let captures = pattern
                .captures(line)
                .ok_or_else(|| PricingError::MalformedCase {
                    line: line_no,
                    text: line.to_string(),
                })?;

            let option_list_str = captures
                .name("match_options")
                .map(|v| v.as_str().trim())
                .unwrap_or("");
            let mut criteria = Vec::new();
            if !option_list_str.is_empty() {
                for option in option_list_str.split(',') {
                    let id = registry.ensure_registered(option).ok_or_else(|| {
                        PricingError::UnknownOption {
                            line: line_no,
                            option: option.trim().to_string(),
                        }
                    })?;
                    if !relevant_activities.contains(&registry.act_ref(id)) {
                        relevant_activities.push(registry.act_ref(id));
                    }
                    criteria.push(id);
                }
            }

            // the price regex only admits valid decimals
            let price_str = captures["price"].replace(',', ".");
            let price: Decimal = price_str
                .parse()
                .map_err(|_| PricingError::MalformedCase {
                    line: line_no,
                    text: line.to_string(),
                })?;
            let comment = captures
                .name("comment")
                .map(|v| v.as_str().to_string())
                .unwrap_or_else(|| description.to_string());
            let filter_slug = captures
                .name("filter_slug")
                .map(|v| v.as_str().to_string())
                .or_else(|| default_filter_slug.map(str::to_string));

            cases.push((
                criteria,
                PricingData {
                    price: Money::new(price, currency),
                    comment,
                    filter_slug,
                },
            ));
        }

        Ok(Self {
            description: description.to_string(),
            default_filter_slug: default_filter_slug.map(str::to_string),
            no_match_default,
            count_multiple,
            cases,
            relevant_activities,
        })
    }

    /// Activities referenced by the rule's criteria.
    pub fn relevant_activities(&self) -> &[Option<i32>] {
        &self.relevant_activities
    }

    /// First case whose criteria are all satisfied by `held`; the rule
    /// defaults otherwise.
    pub fn evaluate(&self, registry: &ActivityOptionRegistry, held: &[OptionId]) -> PricingData {
        for (criteria, data) in &self.cases {
            let matched = criteria
                .iter()
                .all(|criterion| held.iter().any(|opt| registry.contains(*criterion, *opt)));
            if matched {
                return data.clone();
            }
        }
        PricingData {
            price: self.no_match_default,
            comment: self.description.clone(),
            filter_slug: self.default_filter_slug.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use shared::money::Currency;

    fn eur(amount: Decimal) -> Money {
        Money::new(amount, Currency::from_code("EUR").unwrap())
    }

    fn rule(spec: &str, registry: &mut ActivityOptionRegistry) -> PricingRule {
        PricingRule::parse(spec, "Membership fee", None, eur(dec!(5)), true, registry)
            .expect("rule should parse")
    }

    #[test]
    fn no_match_returns_default() {
        let mut registry = ActivityOptionRegistry::new(None);
        let rule = rule("[/foo, /bar/baz] -> 10", &mut registry);
        let qux = registry.ensure_registered("/qux").unwrap();
        let data = rule.evaluate(&registry, &[qux]);
        assert_eq!(data.price, eur(dec!(5)));
        assert_eq!(data.comment, "Membership fee");
        assert_eq!(data.filter_slug, None);
    }

    #[test]
    fn all_criteria_must_be_satisfied() {
        let mut registry = ActivityOptionRegistry::new(None);
        let rule = rule("[/foo, /bar] -> 10\n[/foo] -> 8", &mut registry);
        let foo_day = registry.ensure_registered("/foo/day").unwrap();
        let bar_bus = registry.ensure_registered("/bar/bus").unwrap();
        assert_eq!(rule.evaluate(&registry, &[foo_day]).price, eur(dec!(8)));
        assert_eq!(
            rule.evaluate(&registry, &[foo_day, bar_bus]).price,
            eur(dec!(10))
        );
    }

    #[test]
    fn criteria_match_strict_descendants_only() {
        let mut registry = ActivityOptionRegistry::new(None);
        let rule = rule("[/meals] -> 12", &mut registry);
        let veggie = registry.ensure_registered("/meals/veggie").unwrap();
        let meals = registry.get("/meals").unwrap();
        assert_eq!(rule.evaluate(&registry, &[veggie]).price, eur(dec!(12)));
        // holding the criterion itself is not a match; only descendants are
        assert_eq!(rule.evaluate(&registry, &[meals]).price, eur(dec!(5)));
        // monotonicity: adding options never unmatches a matching rule
        assert_eq!(
            rule.evaluate(&registry, &[veggie, meals]).price,
            eur(dec!(12))
        );
    }

    #[test]
    fn first_matching_case_wins() {
        let mut registry = ActivityOptionRegistry::new(None);
        let rule = rule("[/a] -> 3\n[/a/b] -> 9", &mut registry);
        let ab = registry.get("/a/b").unwrap();
        assert_eq!(registry.path(ab), "/a/b");
        assert_eq!(rule.evaluate(&registry, &[ab]).price, eur(dec!(3)));
    }

    #[test]
    fn comment_and_slug_are_picked_up() {
        let mut registry = ActivityOptionRegistry::new(None);
        let rule = PricingRule::parse(
            "[/dinner] -> 21,50 \"Dinner, members\" <dinner>",
            "Dinner",
            Some("food"),
            eur(dec!(0)),
            true,
            &mut registry,
        )
        .unwrap();
        let attending = registry.ensure_registered("/dinner/attending").unwrap();
        let data = rule.evaluate(&registry, &[attending]);
        assert_eq!(data.price, eur(dec!(21.50)));
        assert_eq!(data.comment, "Dinner, members");
        assert_eq!(data.filter_slug.as_deref(), Some("dinner"));

        // defaults kick in when the case omits them
        let data = rule.evaluate(&registry, &[]);
        assert_eq!(data.comment, "Dinner");
        assert_eq!(data.filter_slug.as_deref(), Some("food"));
    }

    #[test]
    fn empty_criteria_always_match() {
        let mut registry = ActivityOptionRegistry::new(None);
        let rule = rule("[] -> 7", &mut registry);
        assert_eq!(rule.evaluate(&registry, &[]).price, eur(dec!(7)));
    }

    #[test]
    fn rooted_paths_bind_to_activities() {
        let mut registry = ActivityOptionRegistry::new(Some(3));
        let rule = rule("[//7/day1, //self/day2] -> 15", &mut registry);
        assert!(rule.relevant_activities().contains(&Some(7)));
        assert!(rule.relevant_activities().contains(&Some(3)));
        // the same component path under different activities is distinct
        let day1_of_7 = registry.get("//7/day1").unwrap();
        let day1_local = registry.ensure_registered("/day1").unwrap();
        assert_ne!(day1_of_7, day1_local);
    }

    #[test]
    fn malformed_line_is_fatal_with_line_number() {
        let mut registry = ActivityOptionRegistry::new(None);
        let err = PricingRule::parse(
            "[/ok] -> 4\nnot a rule",
            "x",
            None,
            eur(dec!(1)),
            true,
            &mut registry,
        )
        .unwrap_err();
        assert_eq!(
            err,
            PricingError::MalformedCase {
                line: 2,
                text: "not a rule".to_string()
            }
        );
    }

    #[test]
    fn bad_option_path_is_fatal() {
        let mut registry = ActivityOptionRegistry::new(None);
        let err = PricingRule::parse(
            "[/sp aces] -> 4",
            "x",
            None,
            eur(dec!(1)),
            true,
            &mut registry,
        )
        .unwrap_err();
        assert!(matches!(err, PricingError::UnknownOption { line: 1, .. }));
    }
}
