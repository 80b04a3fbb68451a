//! Minimal blocking HTTP/1.1 server.
//!
//! One connection is accepted at a time and its handler runs to completion
//! before the next accept; an install keeps the client waiting until it is
//! done. Reads use a short timeout only to find the end of a request whose
//! size is a multiple of the buffer size, the total request time is
//! unbounded.

use std::{
	collections::HashMap,
	io::{ErrorKind, Read, Write},
	net::{TcpListener, TcpStream},
	time::Duration,
};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};

use crate::boot::{self, BootManager};
use crate::fetch::HttpFetcher;
use crate::install::InstallManager;
use crate::manifest::{manifest_values, OsManifest};

const READ_BUFFER_SIZE: usize = 4096;
const READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
pub struct Request {
	pub method: String,
	pub path: String,
	pub headers: HashMap<String, String>,
	pub body: String,
}

pub struct Response {
	pub code: u16,
	pub phrase: &'static str,
	pub body: String,
}

impl Response {
	fn new(code: u16, phrase: &'static str, body: impl Into<String>) -> Self {
		Response {
			code,
			phrase,
			body: body.into(),
		}
	}

	fn render(&self) -> String {
		let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
		format!(
			"HTTP/1.1 {} {}\r\nServer: {}/{}\r\nDate: {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
			self.code,
			self.phrase,
			env!("CARGO_PKG_NAME"),
			env!("CARGO_PKG_VERSION"),
			date,
			self.body.len(),
			self.body
		)
	}

	fn send(&self, stream: &mut TcpStream) -> Result<()> {
		debug!("Sending response {} {}", self.code, self.phrase);
		stream.write_all(self.render().as_bytes())?;
		stream.flush()?;
		Ok(())
	}
}

/// Parse the request line and headers, returning the body found after the
/// blank line.
pub fn parse_request(raw: &str) -> Result<Request> {
	let (head, body) = match raw.split_once("\r\n\r\n") {
		Some((head, body)) => (head, body),
		None => (raw, ""),
	};
	let mut lines = head.lines();
	let request_line = lines.next().context("Empty request")?;
	let fields: Vec<&str> = request_line.split(' ').collect();
	if fields.len() != 3 {
		bail!("Request line does not conform to the specification");
	}
	if fields[2].trim_end() != "HTTP/1.1" {
		bail!("This server only supports HTTP/1.1, found {}", fields[2]);
	}

	let mut request = Request {
		method: fields[0].to_string(),
		path: fields[1].to_string(),
		..Default::default()
	};
	for line in lines {
		let Some((key, value)) = line.split_once(':') else {
			warn!("Ignoring malformed header line: {}", line);
			continue;
		};
		request
			.headers
			.insert(key.trim().to_string(), value.trim().to_string());
	}
	request.body = body.to_string();
	Ok(request)
}

/// Read from the socket until a read comes up short. The timeout catches the
/// corner where the request size is an exact multiple of the buffer size.
fn read_chunk(stream: &mut TcpStream) -> Result<String> {
	let mut collected = Vec::new();
	let mut buffer = [0u8; READ_BUFFER_SIZE];
	loop {
		match stream.read(&mut buffer) {
			Ok(0) => break,
			Ok(n) => {
				collected.extend_from_slice(&buffer[..n]);
				if n < READ_BUFFER_SIZE {
					break;
				}
			}
			Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
				debug!("Read timeout, treating the request as complete");
				break;
			}
			Err(e) => return Err(e).context("Error reading from the socket"),
		}
	}
	Ok(String::from_utf8_lossy(&collected).to_string())
}

fn read_request(stream: &mut TcpStream) -> Result<Request> {
	let raw = read_chunk(stream)?;
	let mut request = parse_request(&raw)?;

	if request
		.headers
		.get("Expect")
		.is_some_and(|v| v.starts_with("100-continue"))
	{
		debug!("Found Expect header, sending an interim response");
		Response::new(100, "Continue", "").send(stream)?;
		let body = read_chunk(stream)?;
		request.body.push_str(&body);
	}
	Ok(request)
}

/// Accept and handle requests forever. The dispatcher handle is what lets
/// the reboot and boot-partition routes act; there is no global state.
pub fn serve(port: u16, boot_manager: &BootManager) -> Result<()> {
	let listener = TcpListener::bind(("0.0.0.0", port))
		.context(format!("Unable to open the listening socket on port {}", port))?;
	info!("Listening on port {}", port);

	for stream in listener.incoming() {
		let mut stream = match stream {
			Ok(s) => s,
			Err(e) => {
				error!("Unable to accept connection: {}", e);
				continue;
			}
		};
		info!("Connection accepted");
		stream.set_read_timeout(Some(READ_TIMEOUT))?;

		let (response, reboot_after) = match read_request(&mut stream) {
			Ok(request) => route(&request),
			Err(e) => {
				error!("Unable to process request: {:#}", e);
				(Response::new(400, "Bad Request", "Bad Request"), false)
			}
		};

		if let Err(e) = response.send(&mut stream) {
			error!("Unable to send response: {:#}", e);
			continue;
		}
		info!("Finished processing request");

		if reboot_after {
			/* The response is on the wire, shut the connection down before
			 * the reboot tears the process away. */
			let _ = stream.shutdown(std::net::Shutdown::Both);
			if let Err(e) = boot_manager.boot_into_partition(None) {
				error!("Unable to reboot: {:#}", e);
			}
		}
	}
	Ok(())
}

/// Exact `(method, path)` dispatch. The boolean asks the caller to trigger
/// the reboot through the dispatcher handle after the response has been
/// written.
fn route(request: &Request) -> (Response, bool) {
	debug!("Matching routes for {} at {}", request.method, request.path);
	match (request.method.as_str(), request.path.as_str()) {
		("POST", "/os") => (handle_install(&request.body), false),
		("POST", "/bootPartition") => (handle_boot_partition(&request.body), false),
		("POST", "/reboot") => (Response::new(200, "OK", "Rebooting"), true),
		_ => {
			info!(
				"Unable to find a route for {} at {}",
				request.method, request.path
			);
			(Response::new(404, "Not Found", "Not found"), false)
		}
	}
}

/// `POST /os`: install the posted OS list. The response is only sent after
/// the install completed, clients must tolerate long waits.
fn handle_install(body: &str) -> Response {
	let values = match manifest_values(body) {
		Ok(v) => v,
		Err(e) => {
			error!("Rejecting install request: {:#}", e);
			return Response::new(400, "Bad Request", format!("{:#}", e));
		}
	};

	let fetcher = match HttpFetcher::new() {
		Ok(f) => f,
		Err(e) => return Response::new(500, "Internal Server Error", format!("{:#}", e)),
	};
	let mut images = Vec::new();
	for value in &values {
		match OsManifest::resolve(value, &fetcher) {
			Ok(manifest) => images.push(manifest),
			Err(e) => {
				error!("Rejecting OS entry: {:#}", e);
				return Response::new(400, "Bad Request", format!("{:#}", e));
			}
		}
	}

	let mut manager = match InstallManager::new() {
		Ok(m) => m,
		Err(e) => {
			error!("Unable to initialise the installer: {:#}", e);
			return Response::new(500, "Internal Server Error", format!("{:#}", e));
		}
	};

	/* Planning failures reject the request before the card is touched */
	let plan = match manager.prepare(&images) {
		Ok(plan) => plan,
		Err(e) => {
			error!("Rejecting install request: {:#}", e);
			return Response::new(400, "Bad Request", format!("{:#}", e));
		}
	};

	match manager.commit(&mut images, &plan) {
		Ok(()) => Response::new(200, "OK", "Installation finished"),
		Err(e) => {
			error!("Install failed: {:#}", e);
			Response::new(500, "Internal Server Error", format!("{:#}", e))
		}
	}
}

/// `POST /bootPartition`: validate and persist the default boot target.
fn handle_boot_partition(body: &str) -> Response {
	let device = body.trim();
	match boot::set_default_boot_partition(device) {
		Ok(()) => Response::new(200, "OK", "OK"),
		Err(e) => {
			error!("Rejecting boot partition '{}': {:#}", device, e);
			Response::new(400, "Bad Request", format!("{:#}", e))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_request_with_body() -> Result<()> {
		let raw = "POST /os HTTP/1.1\r\nHost: pi\r\nContent-Type: application/json\r\n\r\n{\"name\": \"A\"}";
		let request = parse_request(raw)?;
		assert_eq!(request.method, "POST");
		assert_eq!(request.path, "/os");
		assert_eq!(request.headers.get("Host").map(String::as_str), Some("pi"));
		assert_eq!(request.body, "{\"name\": \"A\"}");
		Ok(())
	}

	#[test]
	fn test_parse_request_without_body() -> Result<()> {
		let request = parse_request("POST /reboot HTTP/1.1\r\n\r\n")?;
		assert_eq!(request.method, "POST");
		assert_eq!(request.path, "/reboot");
		assert!(request.body.is_empty());
		Ok(())
	}

	#[test]
	fn test_parse_request_rejects_other_protocols() {
		assert!(parse_request("GET / HTTP/1.0\r\n\r\n").is_err());
		assert!(parse_request("GET /\r\n\r\n").is_err());
		assert!(parse_request("").is_err());
	}

	#[test]
	fn test_response_render_carries_length() {
		let response = Response::new(200, "OK", "Rebooting");
		let rendered = response.render();
		assert!(rendered.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(rendered.contains("Content-Length: 9\r\n"));
		assert!(rendered.ends_with("\r\n\r\nRebooting"));
	}
}
