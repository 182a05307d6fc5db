//! Distribution mirror access.
//!
//! Downloads `Contents-<arch>.gz` listings for an [`IndexKey`] and walks the
//! mirror's `dists/` directory pages to enumerate the releases and
//! architectures it carries.

use crate::config::loader::MirrorConfig;
use crate::config::types::{DeptraceError, IndexKey, Result};
use crate::index::ContentsIndex;
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Links of interest on one mirror directory page
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DirectoryListing {
    /// Subdirectory names without the trailing `/`
    pub subdirs: BTreeSet<String>,
    /// Architectures of the `Contents-<arch>.gz` files on the page
    pub contents_arches: BTreeSet<String>,
}

/// Collect relative links from an HTML directory index. Absolute links,
/// parent links and query links (column sorting) are ignored.
pub fn parse_directory_listing(html: &str) -> DirectoryListing {
    let mut listing = DirectoryListing::default();
    for href in hrefs(html) {
        if href.starts_with('/') || href.starts_with('?') || href.starts_with("..") || href.contains("://")
        {
            continue;
        }
        if let Some(dir) = href.strip_suffix('/') {
            if !dir.is_empty() && !dir.contains('/') {
                listing.subdirs.insert(dir.to_string());
            }
        } else if let Some(arch) = href
            .strip_prefix("Contents-")
            .and_then(|rest| rest.strip_suffix(".gz"))
        {
            if !arch.is_empty() {
                listing.contents_arches.insert(arch.to_string());
            }
        }
    }
    listing
}

fn hrefs(html: &str) -> impl Iterator<Item = &str> {
    html.split("href=").skip(1).filter_map(|rest| {
        let quote = rest.chars().next().filter(|q| *q == '"' || *q == '\'')?;
        let rest = &rest[1..];
        rest.find(quote).map(|end| &rest[..end])
    })
}

/// HTTP client bound to one mirror layout
pub struct ArchiveMirror {
    client: Client,
    dists_url: String,
    contents_url: String,
}

impl ArchiveMirror {
    pub fn new(config: &MirrorConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("deptrace/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DeptraceError::Backend(format!("cannot set up HTTP client: {}", e)))?;

        let mut dists_url = config.dists_url.clone();
        if !dists_url.ends_with('/') {
            dists_url.push('/');
        }
        Ok(Self {
            client,
            dists_url,
            contents_url: config.contents_url.clone(),
        })
    }

    /// Listing URL for `key`
    pub fn contents_url(&self, key: &IndexKey) -> String {
        self.contents_url
            .replace("{os}", &key.os)
            .replace("{release}", &key.release)
            .replace("{arch}", &key.arch)
    }

    fn get(&self, url: &str) -> Result<Response> {
        self.client
            .get(url)
            .send()
            .map_err(|e| DeptraceError::Backend(format!("GET {} failed: {}", url, e)))
    }

    fn get_text(&self, url: &str) -> Result<String> {
        let response = self.get(url)?;
        if !response.status().is_success() {
            return Err(DeptraceError::Backend(format!(
                "HTTP {} fetching {}",
                response.status(),
                url
            )));
        }
        response
            .text()
            .map_err(|e| DeptraceError::Backend(format!("reading {} failed: {}", url, e)))
    }

    /// Download the listing for `key` into `dest_dir`
    pub fn download_contents(&self, key: &IndexKey, dest_dir: &Path) -> Result<PathBuf> {
        let url = self.contents_url(key);
        log::info!(
            "Downloading {}\nThis is a one-time download and may take a few minutes.",
            url
        );

        let mut response = self.get(&url)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(DeptraceError::Backend(format!(
                "no package database for {} at {}; run `deptrace index list` for the available configurations",
                key, url
            )));
        }
        if !status.is_success() {
            return Err(DeptraceError::Backend(format!(
                "HTTP {} downloading the package database for {} from {}",
                status, key, url
            )));
        }

        std::fs::create_dir_all(dest_dir)?;
        let path = dest_dir.join(format!("{}.contents.gz", key.file_stem()));
        let partial = path.with_extension("gz.part");

        let copied = File::create(&partial)
            .map_err(DeptraceError::from)
            .and_then(|file| {
                let mut out = BufWriter::new(file);
                let bytes = response.copy_to(&mut out).map_err(|e| {
                    DeptraceError::Backend(format!("download of {} interrupted: {}", url, e))
                })?;
                out.flush()?;
                Ok(bytes)
            });
        let bytes = match copied {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = std::fs::remove_file(&partial);
                return Err(e);
            }
        };
        std::fs::rename(&partial, &path)?;
        log::debug!("Downloaded {} bytes to {}", bytes, path.display());
        Ok(path)
    }

    /// Download and parse the index for `key`; the listing is removed once
    /// parsed
    pub fn fetch_index(&self, key: &IndexKey, scratch_dir: &Path) -> Result<ContentsIndex> {
        let listing = self.download_contents(key, scratch_dir)?;
        let index = ContentsIndex::from_contents_file(key.clone(), &listing);
        if let Err(e) = std::fs::remove_file(&listing) {
            log::warn!("Failed to remove {}: {}", listing.display(), e);
        }
        index
    }

    /// Every release and architecture on the mirror that has a listing,
    /// sorted. Package manager and os are taken from `template`.
    pub fn configurations(&self, template: &IndexKey) -> Result<Vec<IndexKey>> {
        let top = parse_directory_listing(&self.get_text(&self.dists_url)?);
        let mut keys = Vec::new();
        for release in &top.subdirs {
            let url = format!("{}{}/", self.dists_url, release);
            let page = match self.get_text(&url) {
                Ok(page) => parse_directory_listing(&page),
                Err(e) => {
                    log::warn!("Skipping release {}: {}", release, e);
                    continue;
                }
            };
            for arch in page.contents_arches {
                keys.push(IndexKey::new(
                    template.package_manager.clone(),
                    template.os.clone(),
                    release.clone(),
                    arch,
                ));
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::PackageIndex;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    const DISTS_PAGE: &str = r#"<html><body>
<a href="?C=N;O=D">Name</a>
<a href="/ubuntu/">Parent Directory</a>
<a href="jammy/">jammy/</a>
<a href="noble/">noble/</a>
<a href='focal-security/'>focal-security/</a>
<a href="http://example.com/other/">elsewhere</a>
</body></html>"#;

    const RELEASE_PAGE: &str = r#"<a href="../">..</a>
<a href="Contents-amd64.gz">Contents-amd64.gz</a>
<a href="Contents-i386.gz">Contents-i386.gz</a>
<a href="Release">Release</a>
<a href="main/">main/</a>"#;

    /// Serve each `(path, status, body)` once per matching request, on
    /// a local port; returns the base URL
    fn serve(routes: Vec<(&'static str, u16, Vec<u8>)>, requests: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        std::thread::spawn(move || {
            for stream in listener.incoming().take(requests) {
                let mut stream = stream.unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).unwrap();
                    if header.trim().is_empty() {
                        break;
                    }
                }
                let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();
                let (status, body) = routes
                    .iter()
                    .find(|(p, _, _)| *p == path)
                    .map(|(_, s, b)| (*s, b.clone()))
                    .unwrap_or((404, b"not found".to_vec()));
                let head = format!(
                    "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                stream.write_all(head.as_bytes()).unwrap();
                stream.write_all(&body).unwrap();
            }
        });
        base
    }

    fn mirror(base: &str) -> ArchiveMirror {
        ArchiveMirror::new(&MirrorConfig {
            dists_url: format!("{}/dists", base),
            contents_url: format!("{}/dists/{{release}}/Contents-{{arch}}.gz", base),
            timeout_secs: 10,
        })
        .unwrap()
    }

    fn key() -> IndexKey {
        IndexKey::new("apt", "ubuntu", "noble", "amd64")
    }

    #[test]
    fn test_directory_listing_links() {
        let top = parse_directory_listing(DISTS_PAGE);
        let releases: Vec<&str> = top.subdirs.iter().map(String::as_str).collect();
        assert_eq!(releases, vec!["focal-security", "jammy", "noble"]);
        assert!(top.contents_arches.is_empty());

        let release = parse_directory_listing(RELEASE_PAGE);
        let arches: Vec<&str> = release.contents_arches.iter().map(String::as_str).collect();
        assert_eq!(arches, vec!["amd64", "i386"]);
        assert!(release.subdirs.contains("main"));
    }

    #[test]
    fn test_contents_url_template() {
        let mirror = ArchiveMirror::new(&MirrorConfig {
            contents_url: "http://deb.example/{os}/dists/{release}/main/Contents-{arch}.gz".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            mirror.contents_url(&IndexKey::new("apt", "debian", "bookworm", "arm64")),
            "http://deb.example/debian/dists/bookworm/main/Contents-arm64.gz"
        );
        assert_eq!(
            ArchiveMirror::new(&MirrorConfig::default()).unwrap().contents_url(&key()),
            "http://security.ubuntu.com/ubuntu/dists/noble/Contents-amd64.gz"
        );
    }

    #[test]
    fn test_fetch_index_downloads_and_parses() {
        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(b"usr/bin/tool    utils/a,utils/b\n").unwrap();
        let body = gz.finish().unwrap();
        let base = serve(vec![("/dists/noble/Contents-amd64.gz", 200, body)], 1);

        let scratch = tempfile::tempdir().unwrap();
        let index = mirror(&base).fetch_index(&key(), scratch.path()).unwrap();
        assert_eq!(index.key(), &key());
        assert_eq!(index.lookup("/usr/bin/tool").unwrap(), vec!["a", "b"]);
        assert_eq!(index.lookup("/usr/bin/cc").unwrap(), vec!["gcc", "g++", "clang"]);
        // the downloaded listing does not linger
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_listing_names_the_configuration() {
        let base = serve(Vec::new(), 1);
        let scratch = tempfile::tempdir().unwrap();
        let err = mirror(&base)
            .download_contents(&key(), scratch.path())
            .unwrap_err();
        match err {
            DeptraceError::Backend(message) => {
                assert!(message.contains("ubuntu:noble-amd64"), "{}", message);
                assert!(message.contains("index list"), "{}", message);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let mut leftovers = String::new();
        for entry in std::fs::read_dir(scratch.path()).unwrap() {
            leftovers.push_str(&entry.unwrap().file_name().to_string_lossy());
        }
        assert!(leftovers.is_empty(), "left behind: {}", leftovers);
    }

    #[test]
    fn test_configurations_walk_releases() {
        let base = serve(
            vec![
                ("/dists/", 200, DISTS_PAGE.as_bytes().to_vec()),
                ("/dists/focal-security/", 500, Vec::new()),
                ("/dists/jammy/", 200, RELEASE_PAGE.as_bytes().to_vec()),
                ("/dists/noble/", 200, b"<a href=\"Contents-arm64.gz\">x</a>".to_vec()),
            ],
            4,
        );
        let keys = mirror(&base).configurations(&key()).unwrap();
        let found: Vec<(String, String)> = keys
            .into_iter()
            .map(|k| (k.release, k.arch))
            .collect();
        assert_eq!(
            found,
            vec![
                ("jammy".to_string(), "amd64".to_string()),
                ("jammy".to_string(), "i386".to_string()),
                ("noble".to_string(), "arm64".to_string()),
            ]
        );
    }
}
