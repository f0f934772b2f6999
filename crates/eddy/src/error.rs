use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("reactor is already running on another thread")]
    AlreadyRunning,
    #[error("multiplex backend failed")]
    Multiplex(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum PerformError {
    #[error("performer is closed")]
    Closed,
    #[error("couldn't signal the reactor through the self-pipe")]
    Wake(#[source] std::io::Error),
}
