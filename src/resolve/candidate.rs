use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Packages chosen to install together for one trial
///
/// Insertion order is kept for display and install order; equality and
/// hashing look only at contents, so `[a, b]` and `[b, a]` are the same set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateSet {
    packages: Vec<String>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a package list, dropping repeats
    pub fn from_packages<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for package in packages {
            set.insert(package.into());
        }
        set
    }

    fn insert(&mut self, package: String) {
        if !self.packages.contains(&package) {
            self.packages.push(package);
        }
    }

    /// This set plus `package` at the end
    pub fn with(&self, package: &str) -> Self {
        let mut next = self.clone();
        next.insert(package.to_string());
        next
    }

    /// This set followed by the packages of `other` it lacks
    pub fn concat(&self, other: &CandidateSet) -> Self {
        let mut next = self.clone();
        for package in &other.packages {
            next.insert(package.clone());
        }
        next
    }

    pub fn contains(&self, package: &str) -> bool {
        self.packages.iter().any(|p| p == package)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.packages.clone()
    }

    pub fn is_superset_of(&self, other: &CandidateSet) -> bool {
        other.packages.iter().all(|p| self.contains(p))
    }

    /// Strict superset: every package of `other` plus at least one more
    pub fn is_strict_superset_of(&self, other: &CandidateSet) -> bool {
        self.len() > other.len() && self.is_superset_of(other)
    }

    fn content(&self) -> BTreeSet<&str> {
        self.packages.iter().map(String::as_str).collect()
    }
}

impl PartialEq for CandidateSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.is_superset_of(other)
    }
}

impl Eq for CandidateSet {}

impl Hash for CandidateSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.content().hash(state);
    }
}

impl fmt::Display for CandidateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.packages.is_empty() {
            return write!(f, "(no packages)");
        }
        write!(f, "{}", self.packages.join(", "))
    }
}

/// One package offered by the index, with the missing paths it provides
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageCandidate {
    pub package: String,
    pub paths: Vec<String>,
}
