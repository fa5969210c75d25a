use std::collections::BTreeSet;
use std::str::FromStr;

use serde_json::Value;

/// Which repositories' deliveries are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RepositoryScope {
    #[default]
    All,
    /// `owner/name`, compared case-insensitively.
    Selected(BTreeSet<String>),
}

impl RepositoryScope {
    /// Whether a delivery with this raw payload is in scope.
    ///
    /// Payloads that name no repository (`ping`, org-level events) are always
    /// in scope; so are bodies that are not JSON, since they are stored verbatim.
    pub fn admits(&self, payload: &[u8]) -> bool {
        match self {
            RepositoryScope::All => true,
            RepositoryScope::Selected(repos) => match repository_full_name(payload) {
                Some(name) => repos.contains(&name.to_ascii_lowercase()),
                None => true,
            },
        }
    }
}

impl FromStr for RepositoryScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
            return Ok(RepositoryScope::All);
        }

        let mut repos = BTreeSet::new();
        for entry in trimmed.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.split_once('/') {
                Some((owner, name)) if !owner.is_empty() && !name.is_empty() => {
                    repos.insert(entry.to_ascii_lowercase());
                }
                _ => return Err(format!("expected owner/name, got '{entry}'")),
            }
        }
        if repos.is_empty() {
            return Err("no repositories listed".to_string());
        }
        Ok(RepositoryScope::Selected(repos))
    }
}

fn repository_full_name(payload: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    value
        .get("repository")?
        .get("full_name")?
        .as_str()
        .map(str::to_string)
}
