//! Domain selection
//!
//! Picks, per entry name, which configuration item applies to the running
//! process. A specific domain beats the `*` wildcard no matter the order
//! the items appear in.

use std::collections::btree_map::{BTreeMap, Entry};

pub const WILDCARD: &str = "*";
const LOCALE_SEPARATOR: &str = "::";

/// Process placement, read from `REALM`, `REGION`, `AZ` and `DOMAIN`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeEnv {
    pub realm: String,
    pub region: String,
    pub az: String,
    pub domain: String,
}

impl RuntimeEnv {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).unwrap_or_default();
        Self {
            realm: var("REALM"),
            region: var("REGION"),
            az: var("AZ"),
            domain: var("DOMAIN"),
        }
    }

    pub fn with_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Default::default()
        }
    }
}

/// `realm::region::az::domain`, each segment a value or `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locale {
    segments: Option<[String; 4]>,
}

impl Locale {
    pub fn parse(raw: &str) -> Self {
        let parts: Vec<&str> = raw.trim().split(LOCALE_SEPARATOR).map(str::trim).collect();
        let segments = match parts.as_slice() {
            [realm, region, az, domain] => Some([
                realm.to_string(),
                region.to_string(),
                az.to_string(),
                domain.to_string(),
            ]),
            _ => None,
        };
        Self { segments }
    }

    /// Malformed locales never match.
    pub fn is_valid(&self) -> bool {
        self.segments.is_some()
    }

    pub fn matches(&self, env: &RuntimeEnv) -> bool {
        let Some(segments) = &self.segments else {
            return false;
        };
        let wanted = [&env.realm, &env.region, &env.az, &env.domain];
        segments
            .iter()
            .zip(wanted)
            .all(|(seg, value)| seg == WILDCARD || seg == value)
    }

    pub fn is_wildcard(&self) -> bool {
        self.segments
            .as_ref()
            .is_some_and(|s| s.iter().all(|seg| seg == WILDCARD))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Domain(String),
    Locale(Locale),
}

impl Scope {
    /// `domain` wins when both are set; an empty domain means `*`.
    pub fn from_config(domain: &str, locale: &str) -> Self {
        let domain = domain.trim();
        if domain.is_empty() && !locale.trim().is_empty() {
            return Scope::Locale(Locale::parse(locale));
        }
        if domain.is_empty() {
            Scope::Domain(WILDCARD.to_string())
        } else {
            Scope::Domain(domain.to_string())
        }
    }

    pub fn matches(&self, env: &RuntimeEnv) -> bool {
        match self {
            Scope::Domain(d) => d == WILDCARD || *d == env.domain,
            Scope::Locale(l) => l.matches(env),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        match self {
            Scope::Domain(d) => d == WILDCARD,
            Scope::Locale(l) => l.is_wildcard(),
        }
    }
}

/// A configuration item that can be selected by domain.
pub trait Scoped {
    fn name(&self) -> &str;
    fn enabled(&self) -> bool;
    fn scope(&self) -> Scope;
}

/// Keep at most one item per name. Disabled, unnamed and non-matching items
/// are dropped. The first specific match wins; a specific match replaces an
/// earlier wildcard but a later wildcard never replaces anything.
pub fn select_by_domain<T, I>(items: I, env: &RuntimeEnv) -> BTreeMap<String, T>
where
    T: Scoped,
    I: IntoIterator<Item = T>,
{
    let mut selected: BTreeMap<String, (T, bool)> = BTreeMap::new();

    for item in items {
        if !item.enabled() || item.name().is_empty() {
            continue;
        }
        let scope = item.scope();
        if !scope.matches(env) {
            continue;
        }
        let wildcard = scope.is_wildcard();

        match selected.entry(item.name().to_string()) {
            Entry::Vacant(slot) => {
                slot.insert((item, wildcard));
            }
            Entry::Occupied(mut slot) => {
                if slot.get().1 && !wildcard {
                    slot.insert((item, wildcard));
                }
            }
        }
    }

    selected
        .into_iter()
        .map(|(name, (item, _))| (name, item))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Item {
        name: &'static str,
        enabled: bool,
        domain: &'static str,
        locale: &'static str,
        addr: &'static str,
    }

    impl Scoped for Item {
        fn name(&self) -> &str {
            self.name
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        fn scope(&self) -> Scope {
            Scope::from_config(self.domain, self.locale)
        }
    }

    fn item(name: &'static str, domain: &'static str, addr: &'static str) -> Item {
        Item {
            name,
            enabled: true,
            domain,
            locale: "",
            addr,
        }
    }

    #[test]
    fn test_specific_domain_beats_wildcard() {
        let items = vec![item("db1", "*", "A"), item("db1", "prod", "B")];

        let prod = select_by_domain(items.clone(), &RuntimeEnv::with_domain("prod"));
        assert_eq!(prod.len(), 1);
        assert_eq!(prod["db1"].addr, "B");

        let test = select_by_domain(items, &RuntimeEnv::with_domain("test"));
        assert_eq!(test["db1"].addr, "A");
    }

    #[test]
    fn test_wildcard_after_specific_is_ignored() {
        let items = vec![item("db1", "prod", "B"), item("db1", "*", "A")];
        let selected = select_by_domain(items, &RuntimeEnv::with_domain("prod"));
        assert_eq!(selected["db1"].addr, "B");
    }

    #[test]
    fn test_first_match_wins_among_equals() {
        let items = vec![
            item("db1", "*", "A"),
            item("db1", "*", "C"),
            item("db1", "prod", "B"),
            item("db1", "prod", "D"),
        ];
        let selected = select_by_domain(items, &RuntimeEnv::with_domain("prod"));
        assert_eq!(selected["db1"].addr, "B");
    }

    #[test]
    fn test_disabled_and_unnamed_are_skipped() {
        let mut disabled = item("db1", "*", "A");
        disabled.enabled = false;
        let items = vec![disabled, item("", "*", "X"), item("db2", "prod", "B")];

        let selected = select_by_domain(items, &RuntimeEnv::with_domain("test"));
        assert!(selected.is_empty());
    }

    #[test]
    fn test_empty_domain_is_wildcard() {
        let selected = select_by_domain(vec![item("db1", "", "A")], &RuntimeEnv::default());
        assert_eq!(selected["db1"].addr, "A");
    }

    #[test]
    fn test_locale_selection() {
        let env = RuntimeEnv {
            realm: "rk".to_string(),
            region: "eu".to_string(),
            az: "eu-1".to_string(),
            domain: "prod".to_string(),
        };

        let mut any = item("db1", "", "A");
        any.locale = "*::*::*::*";
        let mut exact = item("db1", "", "B");
        exact.locale = "rk::eu::*::prod";
        let mut other = item("db2", "", "C");
        other.locale = "rk::us::*::prod";

        let selected = select_by_domain(vec![any, exact, other], &env);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected["db1"].addr, "B");
    }

    #[test]
    fn test_malformed_locale_never_matches() {
        let locale = Locale::parse("rk::eu::prod");
        assert!(!locale.is_valid());
        assert!(!locale.matches(&RuntimeEnv::default()));
        assert!(Locale::parse("*::*::*::*").is_wildcard());
    }

    #[test]
    fn test_domain_takes_precedence_over_locale() {
        let scope = Scope::from_config("prod", "*::*::*::*");
        assert_eq!(scope, Scope::Domain("prod".to_string()));
    }
}
