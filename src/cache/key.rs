//! Cache variant keys and the typed pattern matcher used for scoped eviction.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use crate::error::ArborError;

/// Rendered form of an agnostic dimension.
pub const AGNOSTIC_TOKEN: &str = "0";
const ID_SEPARATOR: char = ',';

/// Value of one visibility dimension (store or customer roles) of a cached variant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DimToken {
    /// The variant does not depend on this dimension.
    #[default]
    Agnostic,
    /// Sorted, deduplicated, non-zero ids.
    Ids(Vec<u32>),
}

impl DimToken {
    /// An empty id set (after dropping zeros) is the agnostic token.
    pub fn ids<I: IntoIterator<Item = u32>>(ids: I) -> Self {
        let mut ids = ids.into_iter().filter(|id| *id != 0).collect::<Vec<_>>();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            DimToken::Agnostic
        } else {
            DimToken::Ids(ids)
        }
    }

    pub fn is_agnostic(&self) -> bool {
        matches!(self, DimToken::Agnostic)
    }

    /// The id filter a reader applies for this dimension; `None` when agnostic.
    pub fn as_filter(&self) -> Option<&[u32]> {
        match self {
            DimToken::Agnostic => None,
            DimToken::Ids(ids) => Some(ids),
        }
    }
}

impl Display for DimToken {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            DimToken::Agnostic => write!(f, "{AGNOSTIC_TOKEN}"),
            DimToken::Ids(ids) => {
                let joined = ids
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                write!(f, "{joined}")
            }
        }
    }
}

impl FromStr for DimToken {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == AGNOSTIC_TOKEN {
            return Ok(DimToken::Agnostic);
        }
        let ids = s
            .split(ID_SEPARATOR)
            .map(|part| {
                part.parse::<u32>().map_err(|_| {
                    ArborError::InvalidArgument(format!("invalid dimension token '{s}'"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DimToken::ids(ids))
    }
}

/// Identity of one cached rendering of a logical tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheVariantKey {
    pub tree: String,
    pub language_id: u32,
    pub store: DimToken,
    pub roles: DimToken,
}

impl CacheVariantKey {
    pub fn new(tree: &str, language_id: u32, store: DimToken, roles: DimToken) -> Self {
        CacheVariantKey {
            tree: tree.to_string(),
            language_id,
            store,
            roles,
        }
    }

    /// The store- and ACL-agnostic variant of `tree` for `language_id`.
    pub fn agnostic(tree: &str, language_id: u32) -> Self {
        Self::new(tree, language_id, DimToken::Agnostic, DimToken::Agnostic)
    }
}

impl Display for CacheVariantKey {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}:{}-{}-{}",
            self.tree, self.language_id, self.store, self.roles
        )
    }
}

impl FromStr for CacheVariantKey {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ArborError::InvalidArgument(format!("invalid cache key '{s}'"));
        let (tree, dims) = s.rsplit_once(':').ok_or_else(invalid)?;
        let mut parts = dims.splitn(3, '-');
        let (Some(lang), Some(store), Some(roles)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        Ok(CacheVariantKey {
            tree: tree.to_string(),
            language_id: lang.parse().map_err(|_| invalid())?,
            store: store.parse()?,
            roles: roles.parse()?,
        })
    }
}

/// Match rule for one dimension of a [`KeyPattern`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimPattern {
    #[default]
    Any,
    /// Any token except the agnostic one.
    NonAgnostic,
    Exact(DimToken),
}

impl DimPattern {
    pub fn matches(&self, token: &DimToken) -> bool {
        match self {
            DimPattern::Any => true,
            DimPattern::NonAgnostic => !token.is_agnostic(),
            DimPattern::Exact(expected) => expected == token,
        }
    }

    fn glob(&self) -> String {
        match self {
            DimPattern::Any => "*".to_string(),
            DimPattern::NonAgnostic => format!("[^{AGNOSTIC_TOKEN}]*"),
            DimPattern::Exact(token) => token.to_string(),
        }
    }
}

/// A set of cache keys, selected per dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPattern {
    pub tree: Option<String>,
    pub language: Option<u32>,
    pub store: DimPattern,
    pub roles: DimPattern,
}

impl KeyPattern {
    pub fn all() -> Self {
        KeyPattern::default()
    }

    /// Every variant of `tree`.
    pub fn tree(tree: &str) -> Self {
        KeyPattern {
            tree: Some(tree.to_string()),
            ..Default::default()
        }
    }

    /// Variants of `tree` that were built for a concrete store.
    pub fn tree_non_agnostic_store(tree: &str) -> Self {
        KeyPattern {
            store: DimPattern::NonAgnostic,
            ..Self::tree(tree)
        }
    }

    /// Variants of `tree` that were built for concrete customer roles.
    pub fn tree_non_agnostic_roles(tree: &str) -> Self {
        KeyPattern {
            roles: DimPattern::NonAgnostic,
            ..Self::tree(tree)
        }
    }

    pub fn with_language(mut self, language_id: u32) -> Self {
        self.language = Some(language_id);
        self
    }

    pub fn matches(&self, key: &CacheVariantKey) -> bool {
        self.tree.as_ref().map_or(true, |tree| *tree == key.tree)
            && self.language.map_or(true, |lang| lang == key.language_id)
            && self.store.matches(&key.store)
            && self.roles.matches(&key.roles)
    }

    /// Glob rendering for backends that select keys by string pattern.
    pub fn to_glob(&self) -> String {
        format!(
            "{}:{}-{}-{}",
            self.tree.as_deref().unwrap_or("*"),
            self.language
                .map(|lang| lang.to_string())
                .unwrap_or_else(|| "*".to_string()),
            self.store.glob(),
            self.roles.glob()
        )
    }
}
