//! Module server
//!
//! Serves `.wasm` files from one directory so devices have something to
//! download from. Every response carries an exact Content-Length.

use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tiny_http::{Header, Method, Response, Server};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "serve", version, about = "Serve WASM modules over HTTP")]
struct Args {
    /// Directory holding the .wasm files
    #[arg(default_value = ".")]
    dir: PathBuf,

    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() {
    let args = Args::parse();
    modvisor::init_logging(&args.log);

    let addr = format!("0.0.0.0:{}", args.port);
    let server = match Server::http(&addr) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("serve: cannot listen on {addr}: {e}");
            std::process::exit(1);
        }
    };

    info!(%addr, dir = %args.dir.display(), "serving modules");
    for name in list_modules(&args.dir) {
        info!("  http://<host>:{}/{name}", args.port);
    }

    for request in server.incoming_requests() {
        let response = if *request.method() == Method::Get {
            serve_module(&args.dir, request.url())
        } else {
            text_response(405, "405 Method Not Allowed")
        };
        info!(method = %request.method(), url = request.url(), status = response.status_code().0, "request");
        if let Err(e) = request.respond(response) {
            warn!(error = %e, "response failed");
        }
    }
}

fn list_modules(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".wasm"))
        .collect();
    names.sort();
    names
}

/// Map a request path to a module file, refusing anything outside `dir`
fn resolve(dir: &Path, url: &str) -> Option<PathBuf> {
    let name = url.split('?').next().unwrap_or_default().trim_start_matches('/');
    let valid = !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.starts_with('.')
        && name.ends_with(".wasm");
    valid.then(|| dir.join(name))
}

fn serve_module(dir: &Path, url: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    let Some(path) = resolve(dir, url) else {
        return text_response(404, "404 Not Found");
    };

    match fs::read(&path) {
        Ok(contents) => {
            let response = Response::from_data(contents);
            match Header::from_bytes("Content-Type", "application/wasm") {
                Ok(header) => response.with_header(header),
                Err(()) => response,
            }
        }
        Err(_) => text_response(404, "404 Not Found"),
    }
}

fn text_response(status: u16, body: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    let response = Response::from_string(body).with_status_code(status);
    match Header::from_bytes("Content-Type", "text/plain") {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}
