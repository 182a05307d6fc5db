/// Index built from Debian/Ubuntu `Contents-<arch>` listings
///
/// Each listing line is `<path> <section/pkg>[,<section/pkg>...]`. The
/// parsed map is persisted as JSON under the cache directory, one file per
/// index key.
use crate::config::types::{DeptraceError, IndexKey, Result};
use crate::index::{normalize_lookup_path, PackageIndex};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Header line of older Contents files that precede the listing
const LISTING_HEADER: &str = "FILE";

/// The archive's listings do not mention `usr/bin/cc`; it is an
/// alternatives link owned by whichever compiler is installed
const EXTRA_ENTRIES: &[(&str, &[&str])] = &[("usr/bin/cc", &["gcc", "g++", "clang"])];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentsIndex {
    key: IndexKey,
    /// Seconds since the epoch at build time
    built_at: u64,
    files: HashMap<String, Vec<String>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl ContentsIndex {
    /// Index with only the built-in extra entries
    pub fn new(key: IndexKey) -> Self {
        let mut index = Self {
            key,
            built_at: now_secs(),
            files: HashMap::new(),
        };
        for (path, packages) in EXTRA_ENTRIES {
            let packages: Vec<String> = packages.iter().map(|p| p.to_string()).collect();
            index.insert(path, &packages);
        }
        index
    }

    pub fn key(&self) -> &IndexKey {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Add providers for `path`, keeping first-seen order and skipping
    /// packages already listed
    pub fn insert(&mut self, path: &str, packages: &[String]) {
        let entry = self.files.entry(normalize_lookup_path(path)).or_default();
        for package in packages {
            if !entry.contains(package) {
                entry.push(package.clone());
            }
        }
    }

    /// Parse a plain-text listing
    pub fn parse<R: Read>(key: IndexKey, input: R) -> Result<Self> {
        let mut index = Self::new(key);
        for (idx, line) in BufReader::new(input).lines().enumerate() {
            let line = line?;
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (path, packages) = parse_listing_line(line).ok_or_else(|| {
                DeptraceError::Backend(format!(
                    "unexpected line {} in contents listing: {:?}",
                    idx + 1,
                    line
                ))
            })?;
            if path == LISTING_HEADER {
                index.files.clear();
                continue;
            }
            index.insert(path, &packages);
        }
        // a header resets everything before it, including the extra entries
        for (path, packages) in EXTRA_ENTRIES {
            let packages: Vec<String> = packages.iter().map(|p| p.to_string()).collect();
            index.insert(path, &packages);
        }
        log::info!("Parsed {} paths for {}", index.len(), index.key);
        Ok(index)
    }

    /// Parse a listing file, gzip-compressed or plain
    pub fn from_contents_file(key: IndexKey, source: &Path) -> Result<Self> {
        let mut file = File::open(source).map_err(|e| {
            DeptraceError::Backend(format!(
                "cannot open contents listing {}: {}",
                source.display(),
                e
            ))
        })?;
        let mut magic = [0u8; 2];
        let read = file.read(&mut magic)?;
        let file = File::open(source)?;
        if read == 2 && magic == GZIP_MAGIC {
            Self::parse(key, GzDecoder::new(file))
        } else {
            Self::parse(key, file)
        }
    }

    /// `<cache_dir>/<pm>_<os>_<release>_<arch>.json`
    pub fn cache_path(cache_dir: &Path, key: &IndexKey) -> PathBuf {
        cache_dir.join(format!("{}.json", key.file_stem()))
    }

    pub fn exists(cache_dir: &Path, key: &IndexKey) -> bool {
        Self::cache_path(cache_dir, key).is_file()
    }

    pub fn load(cache_dir: &Path, key: &IndexKey) -> Result<Self> {
        let path = Self::cache_path(cache_dir, key);
        let file = File::open(&path).map_err(|e| {
            DeptraceError::Backend(format!(
                "no package index for {} at {} ({}); run `deptrace index rebuild`",
                key,
                path.display(),
                e
            ))
        })?;
        let index: Self = serde_json::from_reader(BufReader::new(file))?;
        if &index.key != key {
            return Err(DeptraceError::Backend(format!(
                "index at {} belongs to {}, expected {}",
                path.display(),
                index.key,
                key
            )));
        }
        log::debug!("Loaded {} paths for {} from {}", index.len(), key, path.display());
        Ok(index)
    }

    pub fn save(&self, cache_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(cache_dir)?;
        let path = Self::cache_path(cache_dir, &self.key);
        let tmp = path.with_extension("json.tmp");
        let file = File::create(&tmp)?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        std::fs::rename(&tmp, &path)?;
        log::info!("Saved package index for {} to {}", self.key, path.display());
        Ok(path)
    }

    pub fn age(&self) -> Duration {
        Duration::from_secs(now_secs().saturating_sub(self.built_at))
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }
}

impl PackageIndex for ContentsIndex {
    fn lookup(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .files
            .get(&normalize_lookup_path(path))
            .cloned()
            .unwrap_or_default())
    }

    fn rebuild(&mut self, key: &IndexKey, source: &Path) -> Result<()> {
        *self = Self::from_contents_file(key.clone(), source)?;
        Ok(())
    }
}

/// Split a listing line into its path and package names. The package
/// column is the last whitespace-separated field, so paths may contain
/// spaces.
fn parse_listing_line(line: &str) -> Option<(&str, Vec<String>)> {
    let (path, locations) = line.rsplit_once(|c: char| c.is_whitespace())?;
    let path = path.trim_end();
    if path.is_empty() || locations.is_empty() {
        return None;
    }
    let packages = locations
        .split(',')
        .filter_map(|loc| loc.rsplit('/').next())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    if packages.is_empty() {
        return None;
    }
    Some((path, packages))
}
