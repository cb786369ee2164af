use crate::error::{Error, Result};
use crate::executor::PanicStrategy;

const MAX_WORKERS_PER_POOL: usize = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Host worker threads; defaults to the number of logical CPUs.
    pub host_workers: Option<usize>,
    /// Device worker threads; defaults to one per device.
    pub device_workers: Option<usize>,
    /// Accelerators exposed by the default emulated backend.
    pub devices: usize,
    /// Largest device graph the emulated backend will instantiate.
    pub max_graph_nodes: usize,
    pub stack_size: Option<usize>,
    pub thread_name_prefix: String,
    pub enable_telemetry: bool,
    pub panic_strategy: PanicStrategy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_workers: None,
            device_workers: None,
            devices: 1,
            max_graph_nodes: 1 << 16,
            stack_size: Some(2 * 1024 * 1024),
            thread_name_prefix: "heteroflow".to_string(),
            enable_telemetry: true,
            panic_strategy: PanicStrategy::Capture,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.host_workers {
            if n == 0 {
                return Err(Error::config("host_workers must be > 0"));
            }
            if n > MAX_WORKERS_PER_POOL {
                return Err(Error::config("host_workers too large (max 1024)"));
            }
        }

        if let Some(n) = self.device_workers {
            if n > MAX_WORKERS_PER_POOL {
                return Err(Error::config("device_workers too large (max 1024)"));
            }
        }

        if self.max_graph_nodes == 0 {
            return Err(Error::config("max_graph_nodes must be > 0"));
        }

        Ok(())
    }

    pub fn host_worker_threads(&self) -> usize {
        self.host_workers.unwrap_or_else(num_cpus::get)
    }

    /// Device pool size for a backend reporting `device_count` accelerators.
    pub fn device_worker_threads(&self, device_count: usize) -> usize {
        if device_count == 0 {
            return 0;
        }
        self.device_workers.unwrap_or(device_count)
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn host_workers(mut self, n: usize) -> Self {
        self.config.host_workers = Some(n);
        self
    }

    pub fn device_workers(mut self, n: usize) -> Self {
        self.config.device_workers = Some(n);
        self
    }

    pub fn devices(mut self, n: usize) -> Self {
        self.config.devices = n;
        self
    }

    pub fn max_graph_nodes(mut self, n: usize) -> Self {
        self.config.max_graph_nodes = n;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn enable_telemetry(mut self, enable: bool) -> Self {
        self.config.enable_telemetry = enable;
        self
    }

    pub fn panic_strategy(mut self, strategy: PanicStrategy) -> Self {
        self.config.panic_strategy = strategy;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.devices, 1);
        assert_eq!(config.device_worker_threads(4), 4);
        assert_eq!(config.device_worker_threads(0), 0);
        assert!(config.host_worker_threads() >= 1);
    }

    #[test]
    fn test_builder() {
        let config = Config::builder()
            .host_workers(3)
            .device_workers(2)
            .devices(4)
            .thread_name_prefix("test")
            .build()
            .unwrap();

        assert_eq!(config.host_worker_threads(), 3);
        assert_eq!(config.device_worker_threads(4), 2);
        assert_eq!(config.thread_name_prefix, "test");
        assert_eq!(config.panic_strategy, PanicStrategy::Capture);
    }

    #[test]
    fn test_rejects_zero_host_workers() {
        let result = Config::builder().host_workers(0).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_oversized_pools() {
        assert!(Config::builder().host_workers(2048).build().is_err());
        assert!(Config::builder().device_workers(2048).build().is_err());
        assert!(Config::builder().max_graph_nodes(0).build().is_err());
    }
}
