//! Per-core thermal design power of a CPU model, resolved from vendor spec
//! pages and memoized in the on-disk cache.

pub mod cache;
pub mod repair;
pub mod scraper;

use crate::config::Config;
use crate::tdp::cache::TdpCache;
use crate::tdp::scraper::scan_spec_page;
use crate::utils::errors::CarbonError;
use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::{Client, ClientBuilder, Response};
use serde::Serialize;
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TdpInfo {
    pub cpu: String,
    pub watts_per_core: f64,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Intel,
    Amd,
}

impl Vendor {
    /// Vendor from the brand string prefix.
    pub fn detect(cpu: &str) -> Result<Self, CarbonError> {
        if cpu.starts_with("Intel") {
            Ok(Vendor::Intel)
        } else if cpu.starts_with("AMD") {
            Ok(Vendor::Amd)
        } else {
            Err(CarbonError::UnknownVendor(cpu.to_string()))
        }
    }

    pub fn domain(&self) -> &'static str {
        match self {
            Vendor::Intel => "www.intel.com",
            Vendor::Amd => "www.amd.com",
        }
    }

    /// "!" makes the redirector jump straight to the first hit.
    pub fn search_query(&self, cpu: &str) -> String {
        match self {
            Vendor::Intel => format!("! {} site:{}", cpu, self.domain()),
            Vendor::Amd => format!("! {} drivers and support site:{}", cpu, self.domain()),
        }
    }

    pub fn search_url(&self, endpoint: &str, cpu: &str) -> Result<Url, CarbonError> {
        Url::parse_with_params(
            endpoint,
            &[("q", self.search_query(cpu).as_str()), ("format", "json")],
        )
        .map_err(|e| CarbonError::VendorResolution {
            cpu: cpu.to_string(),
            reason: format!("invalid search endpoint `{}`: {}", endpoint, e),
        })
    }
}

/// Where spec pages come from.
#[async_trait]
pub trait SpecSource: Send + Sync {
    /// Follows the search redirector to the vendor's spec page.
    async fn locate(&self, cpu: &str, search_url: &Url) -> Result<Url, CarbonError>;
    async fn fetch(&self, page_url: &Url) -> Result<String, CarbonError>;
}

pub struct HttpSpecSource {
    redirector: Client,
    pages: Client,
}

impl HttpSpecSource {
    pub fn new() -> Result<Self, CarbonError> {
        Self::with_builder(Client::builder)
    }

    fn with_builder(builder: fn() -> ClientBuilder) -> Result<Self, CarbonError> {
        let user_agent = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
        let build_error = |e: reqwest::Error| CarbonError::Other(format!("build HTTP client: {}", e));
        let redirector = builder()
            .user_agent(user_agent)
            .redirect(Policy::none())
            .build()
            .map_err(build_error)?;
        let pages = builder()
            .user_agent(user_agent)
            .build()
            .map_err(build_error)?;
        Ok(Self { redirector, pages })
    }
}

#[async_trait]
impl SpecSource for HttpSpecSource {
    async fn locate(&self, cpu: &str, search_url: &Url) -> Result<Url, CarbonError> {
        let response = self
            .redirector
            .get(search_url.clone())
            .send()
            .await
            .map_err(|source| CarbonError::Fetch {
                url: search_url.to_string(),
                source,
            })?;

        let resolution_error = |reason: String| CarbonError::VendorResolution {
            cpu: cpu.to_string(),
            reason,
        };
        let location = response
            .headers()
            .get(LOCATION)
            .ok_or_else(|| {
                resolution_error(format!(
                    "no redirect location in response ({})",
                    response.status()
                ))
            })?
            .to_str()
            .map_err(|e| resolution_error(format!("unreadable location header: {}", e)))?;

        search_url
            .join(location)
            .map_err(|e| resolution_error(format!("invalid location `{}`: {}", location, e)))
    }

    async fn fetch(&self, page_url: &Url) -> Result<String, CarbonError> {
        let fetch_error = |source| CarbonError::Fetch {
            url: page_url.to_string(),
            source,
        };
        let response = self
            .pages
            .get(page_url.clone())
            .send()
            .await
            .and_then(Response::error_for_status)
            .map_err(fetch_error)?;
        response.text().await.map_err(fetch_error)
    }
}

/// Anything that can turn a CPU brand string into its per-core TDP.
#[async_trait]
pub trait TdpLookup: Send + Sync {
    async fn lookup(&self, cpu: &str) -> Result<TdpInfo, CarbonError>;
}

pub struct TdpResolver<S> {
    cache: TdpCache,
    source: S,
    search_endpoint: String,
}

impl TdpResolver<HttpSpecSource> {
    /// Resolver over the network, caching in the configured state directory.
    pub fn from_config(config: &Config) -> Result<Self, CarbonError> {
        config.ensure_state_dir()?;
        Ok(Self::new(
            TdpCache::new(config.tdp_cache_path()),
            HttpSpecSource::new()?,
            config.search_endpoint.clone(),
        ))
    }
}

impl<S: SpecSource> TdpResolver<S> {
    pub fn new(cache: TdpCache, source: S, search_endpoint: impl Into<String>) -> Self {
        Self {
            cache,
            source,
            search_endpoint: search_endpoint.into(),
        }
    }

    pub fn cache(&self) -> &TdpCache {
        &self.cache
    }

    /// Cache first; on a miss the spec page is scraped and the result cached.
    pub async fn resolve(&self, cpu: &str) -> Result<TdpInfo, CarbonError> {
        if let Some(cached) = self.cache.lookup(cpu)? {
            return Ok(cached);
        }
        info!("TDP for `{}` not cached, looking it up", cpu);
        let resolved = self.resolve_uncached(cpu).await?;
        self.cache.insert(&resolved)
    }

    /// Scrapes the spec page without touching the cache.
    pub async fn resolve_uncached(&self, cpu: &str) -> Result<TdpInfo, CarbonError> {
        let vendor = Vendor::detect(cpu)?;
        let search_url = vendor.search_url(&self.search_endpoint, cpu)?;
        let page_url = self.source.locate(cpu, &search_url).await?;
        debug!("Spec page for `{}`: {}", cpu, page_url);

        let html = self.source.fetch(&page_url).await?;
        let specs = scan_spec_page(&html).map_err(|source| CarbonError::EmbeddedSpecs {
            url: page_url.to_string(),
            source,
        })?;
        let watts_per_core = specs.watts_per_core().ok_or_else(|| CarbonError::TdpNotFound {
            url: page_url.to_string(),
        })?;
        debug!(
            "`{}`: package TDP {:?} W, {:?} cores",
            cpu, specs.package_tdp, specs.core_count
        );

        Ok(TdpInfo {
            cpu: cpu.to_string(),
            watts_per_core,
            source: page_url.to_string(),
        })
    }
}

#[async_trait]
impl<S: SpecSource> TdpLookup for TdpResolver<S> {
    async fn lookup(&self, cpu: &str) -> Result<TdpInfo, CarbonError> {
        self.resolve(cpu).await
    }
}
