use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to start tunnel ({program}): {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tunnel on port {local_port} not accepting connections after {attempts} attempts")]
    NotReady { local_port: u16, attempts: u32 },

    #[error("tunnel process for port {local_port} exited")]
    Exited { local_port: u16 },
}

pub type TunnelResult<T> = Result<T, TunnelError>;
