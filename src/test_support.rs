use std::net::TcpListener;

use tokio::runtime::Runtime;
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Mock HTTP server driven from synchronous tests.
pub struct MockHttp {
    runtime: Runtime,
    server: MockServer,
}

impl MockHttp {
    pub fn start() -> Self {
        let runtime = Runtime::new().expect("test runtime");
        let server = runtime.block_on(MockServer::start());
        Self { runtime, server }
    }

    pub fn mount(&self, mock: Mock) {
        self.runtime.block_on(mock.mount(&self.server));
    }

    pub fn base_url(&self) -> String {
        self.server.uri()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.server.uri(), path)
    }

    /// Panics unless every mounted mock saw its expected number of calls.
    pub fn verify(&self) {
        self.runtime.block_on(self.server.verify());
    }

    pub fn received_count(&self) -> usize {
        self.runtime
            .block_on(self.server.received_requests())
            .map(|requests| requests.len())
            .unwrap_or_default()
    }
}

pub fn json_response(status: u16, body: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_raw(body, "application/json")
}

/// An address nothing listens on.
pub fn closed_port_url(path: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind unused port");
    let address = listener.local_addr().expect("unused port address");
    drop(listener);
    format!("http://{address}{path}")
}
