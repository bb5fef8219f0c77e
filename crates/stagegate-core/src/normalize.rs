//! # Material Name Normalization
//!
//! Free-text material names ("foam 35", "FOAM-35", "Schaum 35") are resolved
//! to catalog names here, before any quantity lookup. The gate itself only
//! ever sees resolved names.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How an input name was matched against the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum MaterialMatch {
    /// The input is a catalog name verbatim.
    Exact { name: String },
    /// The input is a configured alias of a catalog name.
    Mapped { input: String, name: String },
    /// The input equals a catalog name after case and punctuation folding.
    Fuzzy { input: String, name: String },
    /// No catalog name could be found.
    Unmatched { input: String },
}

impl MaterialMatch {
    /// The resolved catalog name, if any.
    #[must_use]
    pub fn canonical(&self) -> Option<&str> {
        match self {
            Self::Exact { name } | Self::Mapped { name, .. } | Self::Fuzzy { name, .. } => {
                Some(name)
            }
            Self::Unmatched { .. } => None,
        }
    }
}

/// Resolves input names against a catalog of known names.
pub trait MaterialNameResolver: Send + Sync {
    fn resolve(&self, input: &str, catalog: &BTreeSet<String>) -> MaterialMatch;
}

/// Fold a name to lowercase alphanumerics.
///
/// A `.` or `,` between two digits is a decimal separator and survives as
/// `.`, so "Foam 3.5" and "Foam 35" stay distinct materials.
fn fold(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(chars.len());
    for (i, c) in chars.iter().enumerate() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if matches!(c, '.' | ',') {
            let before = i.checked_sub(1).and_then(|j| chars.get(j));
            let after = chars.get(i + 1);
            if before.is_some_and(char::is_ascii_digit) && after.is_some_and(char::is_ascii_digit) {
                out.push('.');
            }
        }
    }
    out
}

/// Exact, then alias table, then folded comparison.
#[derive(Debug, Clone, Default)]
pub struct AliasResolver {
    /// Folded alias -> catalog name.
    aliases: BTreeMap<String, String>,
}

impl AliasResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `alias -> catalog name` pairs.
    #[must_use]
    pub fn with_aliases<I, A, N>(aliases: I) -> Self
    where
        I: IntoIterator<Item = (A, N)>,
        A: AsRef<str>,
        N: Into<String>,
    {
        Self {
            aliases: aliases
                .into_iter()
                .map(|(alias, name)| (fold(alias.as_ref()), name.into()))
                .collect(),
        }
    }
}

impl MaterialNameResolver for AliasResolver {
    fn resolve(&self, input: &str, catalog: &BTreeSet<String>) -> MaterialMatch {
        let trimmed = input.trim();
        if catalog.contains(trimmed) {
            return MaterialMatch::Exact {
                name: trimmed.to_string(),
            };
        }
        let folded = fold(trimmed);
        if let Some(name) = self.aliases.get(&folded) {
            // An alias only counts when its target is stocked.
            return if catalog.contains(name) {
                MaterialMatch::Mapped {
                    input: input.to_string(),
                    name: name.clone(),
                }
            } else {
                MaterialMatch::Unmatched {
                    input: input.to_string(),
                }
            };
        }
        if !folded.is_empty() {
            let mut candidates = catalog.iter().filter(|known| fold(known) == folded);
            // Two catalog names folding alike are ambiguous.
            if let (Some(name), None) = (candidates.next(), candidates.next()) {
                return MaterialMatch::Fuzzy {
                    input: input.to_string(),
                    name: name.clone(),
                };
            }
        }
        MaterialMatch::Unmatched {
            input: input.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> BTreeSet<String> {
        ["Foam-35", "Plywood 18mm", "Linen"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    #[test]
    fn exact_wins() {
        let r = AliasResolver::new();
        assert_eq!(
            r.resolve("Linen", &catalog()),
            MaterialMatch::Exact {
                name: "Linen".into()
            }
        );
    }

    #[test]
    fn alias_maps_to_catalog_name() {
        let r = AliasResolver::with_aliases([("Schaum 35", "Foam-35")]);
        let m = r.resolve("schaum-35", &catalog());
        assert_eq!(m.canonical(), Some("Foam-35"));
        assert!(matches!(m, MaterialMatch::Mapped { .. }));
    }

    #[test]
    fn folding_matches_case_and_punctuation() {
        let r = AliasResolver::new();
        let m = r.resolve("foam 35", &catalog());
        assert!(matches!(m, MaterialMatch::Fuzzy { ref name, .. } if name == "Foam-35"));
    }

    #[test]
    fn decimal_separator_keeps_materials_apart() {
        let r = AliasResolver::new();
        assert_eq!(r.resolve("Foam 3.5", &catalog()).canonical(), None);

        let mut with_decimal = catalog();
        with_decimal.insert("Foam 3.5".to_string());
        let m = r.resolve("foam 3,5", &with_decimal);
        assert!(matches!(m, MaterialMatch::Fuzzy { ref name, .. } if name == "Foam 3.5"));
    }

    #[test]
    fn ambiguous_fold_is_unmatched() {
        let mut clashing = catalog();
        clashing.insert("FOAM 35".to_string());
        let m = AliasResolver::new().resolve("foam_35", &clashing);
        assert!(matches!(m, MaterialMatch::Unmatched { .. }));
    }

    #[test]
    fn alias_to_unstocked_name_is_unmatched() {
        let r = AliasResolver::with_aliases([("velours", "Velvet")]);
        assert!(matches!(
            r.resolve("Velours", &catalog()),
            MaterialMatch::Unmatched { .. }
        ));
    }

    #[test]
    fn unknown_is_unmatched() {
        let r = AliasResolver::new();
        assert_eq!(r.resolve("Velvet", &catalog()).canonical(), None);
        assert_eq!(r.resolve("--", &catalog()).canonical(), None);
    }
}
