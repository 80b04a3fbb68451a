//! Blocking HTTP fetcher for nested manifest metadata and setup scripts.

use anyhow::{bail, Context, Result};
use log::debug;

/// The seam through which manifest resolution reaches the network.
pub trait Fetch {
	fn get(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpFetcher {
	client: reqwest::blocking::Client,
}

impl HttpFetcher {
	pub fn new() -> Result<Self> {
		let client = reqwest::blocking::Client::builder()
			.user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
			.build()
			.context("Unable to construct the HTTP client")?;
		Ok(HttpFetcher { client })
	}
}

impl Fetch for HttpFetcher {
	fn get(&self, url: &str) -> Result<Vec<u8>> {
		debug!("Downloading {} ...", url);
		// Redirects are followed by the client; only the final status counts.
		let response = self
			.client
			.get(url)
			.send()
			.context(format!("Unable to download {}", url))?;
		let status = response.status();
		if !status.is_success() {
			bail!("GET {} returned {}", url, status);
		}
		let body = response
			.bytes()
			.context(format!("Error reading the body of {}", url))?;
		debug!("Successfully downloaded {} ({} bytes)", url, body.len());
		Ok(body.to_vec())
	}
}
