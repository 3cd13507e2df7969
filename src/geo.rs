//! Server location lookup
//!
//! The server list shows a country flag next to every server whose host is
//! a literal IP address. The country comes from ipapi.co, the icon from
//! flagsapi.com. Lookups never fail loudly: anything unexpected means "no
//! flag".

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use serde::Deserialize;

use crate::fetch::RemoteFetcher;

const COUNTRY_LOOKUP_URL: &str = "https://ipapi.co";
const FLAG_ICON_URL: &str = "https://flagsapi.com";

#[derive(Debug, Deserialize)]
struct IpInfo {
    country_code: Option<String>,
}

/// Resolves an IP address to its ISO 3166 country code.
pub struct CountryCodeProvider<F> {
    fetcher: F,
}

impl<F: RemoteFetcher> CountryCodeProvider<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }

    pub async fn country_code(&self, ip: IpAddr) -> Option<String> {
        let url = format!("{}/{}/json/", COUNTRY_LOOKUP_URL, ip);
        let body = match self.fetcher.fetch(&url).await {
            Ok(body) => body,
            Err(e) => {
                log::warn!("Country lookup for {} failed: {}", ip, e);
                return None;
            }
        };

        match serde_json::from_str::<IpInfo>(&body) {
            Ok(info) => info
                .country_code
                .map(|code| code.trim().to_ascii_uppercase())
                .filter(|code| !code.is_empty()),
            Err(e) => {
                log::warn!("Unreadable country lookup response for {}: {}", ip, e);
                None
            }
        }
    }
}

/// Flag icon URLs per server host. Resolved icons are cached per IP for the
/// process lifetime; failed lookups are retried on the next call.
pub struct FlagIconProvider<F> {
    countries: CountryCodeProvider<F>,
    cache: Mutex<HashMap<IpAddr, String>>,
}

impl<F: RemoteFetcher> FlagIconProvider<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            countries: CountryCodeProvider::new(fetcher),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Icon URL for `host`, or `None` for hostnames, loopback and
    /// unspecified addresses, and failed lookups.
    pub async fn flag_url(&self, host: &str) -> Option<String> {
        let ip = lookup_address(host)?;

        if let Some(cached) = self.cached(ip) {
            return Some(cached);
        }

        let url = icon_url(&self.countries.country_code(ip).await?);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(ip, url.clone());
        }
        Some(url)
    }

    fn cached(&self, ip: IpAddr) -> Option<String> {
        self.cache.lock().ok()?.get(&ip).cloned()
    }
}

/// `https://flagsapi.com/<CC>/flat/64.png`
pub fn icon_url(country_code: &str) -> String {
    format!("{}/{}/flat/64.png", FLAG_ICON_URL, country_code)
}

fn lookup_address(host: &str) -> Option<IpAddr> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = host.parse().ok()?;
    if ip.is_loopback() || ip.is_unspecified() {
        return None;
    }
    Some(ip)
}
