// Docker control surface

pub mod manager;

pub use manager::{ContainerState, DockerError, DockerInfo, DockerManager};
