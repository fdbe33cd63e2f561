//! URL granularity ladder.
//!
//! Every URL decomposes into up to four variants, ordered from coarse to
//! fine: eSLD, FQDN, FQDN+path, path. Candidate filter patterns live at one
//! of these levels, and refinement walks the ladder downwards.

use url::Url;

/// Which URL variant a pattern expresses. The declaration order defines the
/// refinement sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    Esld,
    Fqdn,
    FqdnPath,
    Path,
}

impl Granularity {
    pub const SEQUENCE: [Granularity; 4] = [
        Granularity::Esld,
        Granularity::Fqdn,
        Granularity::FqdnPath,
        Granularity::Path,
    ];

    /// The next, finer level, if any.
    pub fn finer(self) -> Option<Granularity> {
        let index = Self::SEQUENCE.iter().position(|g| *g == self)?;
        Self::SEQUENCE.get(index + 1).copied()
    }

    /// The previous, coarser level, if any.
    pub fn coarser(self) -> Option<Granularity> {
        let index = Self::SEQUENCE.iter().position(|g| *g == self)?;
        index.checked_sub(1).map(|i| Self::SEQUENCE[i])
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Esld => "esld",
            Granularity::Fqdn => "fqdn",
            Granularity::FqdnPath => "fqdn_path",
            Granularity::Path => "path",
        }
    }

    pub fn parse(value: &str) -> Option<Granularity> {
        match value {
            "esld" => Some(Granularity::Esld),
            "fqdn" => Some(Granularity::Fqdn),
            "fqdn_path" => Some(Granularity::FqdnPath),
            "path" => Some(Granularity::Path),
            _ => None,
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The variant strings of one URL. `esld` is absent when the host has no
/// recognizable registrable domain; `fqdn_path` and `path` are absent when
/// the path is empty or `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlVariants {
    pub esld: Option<String>,
    pub fqdn: Option<String>,
    pub fqdn_path: Option<String>,
    pub path: Option<String>,
}

impl UrlVariants {
    /// Decompose `url` into its variants. The scheme and query are dropped;
    /// a missing scheme is tolerated. Returns `None` when the URL has no
    /// host at all.
    pub fn of(url: &str) -> Option<UrlVariants> {
        let normalized;
        let url = if url.contains("://") {
            url
        } else {
            normalized = format!("https://{url}");
            &normalized
        };

        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?.trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }

        let esld = psl::domain_str(&host).map(str::to_owned);

        let path = parsed.path();
        let (fqdn_path, path) = if path.is_empty() || path == "/" {
            (None, None)
        } else {
            (Some(format!("{host}{path}")), Some(path.to_owned()))
        };

        Some(UrlVariants {
            esld,
            fqdn: Some(host),
            fqdn_path,
            path,
        })
    }

    /// The variant string at `level`, if present.
    pub fn at(&self, level: Granularity) -> Option<&str> {
        match level {
            Granularity::Esld => self.esld.as_deref(),
            Granularity::Fqdn => self.fqdn.as_deref(),
            Granularity::FqdnPath => self.fqdn_path.as_deref(),
            Granularity::Path => self.path.as_deref(),
        }
    }
}

/// A FQDN is only worth exploring on its own when it is not a bare `www`
/// mirror and differs from its registrable domain.
pub fn is_real_fqdn(fqdn: &str, esld: &str) -> bool {
    !fqdn.is_empty() && !fqdn.starts_with("www") && fqdn != esld
}

/// Reports `(is_js, has_extension)` for the resource addressed by `url`.
pub fn js_extension(url: &str) -> (bool, bool) {
    let Some(path) = UrlVariants::of(url).and_then(|v| v.path) else {
        return (false, false);
    };

    match path.rsplit_once('.') {
        Some((_, ext)) if !ext.trim().is_empty() => (ext.trim() == "js", true),
        _ => (false, false),
    }
}

/// Browser-internal addresses that never correspond to a blockable request.
pub fn is_filtered_url(url: &str) -> bool {
    url.starts_with("about:") || url.starts_with("chrome") || url.starts_with("data:")
}

pub fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}
