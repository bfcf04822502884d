/// Fixed loopback address of one backing server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub name: &'static str,
    pub host: &'static str,
    pub port: u16,
    pub health_path: &'static str,
}

pub const LLM_ENDPOINT: ServerEndpoint = ServerEndpoint {
    name: "llm",
    host: "127.0.0.1",
    port: 11434,
    health_path: "/api/version",
};

pub const TTS_ENDPOINT: ServerEndpoint = ServerEndpoint {
    name: "tts",
    host: "127.0.0.1",
    port: 8765,
    health_path: "/health",
};

pub const VIDEO_ENDPOINT: ServerEndpoint = ServerEndpoint {
    name: "video-analysis",
    host: "127.0.0.1",
    port: 8766,
    health_path: "/health",
};

impl ServerEndpoint {
    pub const fn with_port(self, port: u16) -> Self {
        Self { port, ..self }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url(), path)
        } else {
            format!("{}/{}", self.base_url(), path)
        }
    }
}
