//! Shared fixtures: a shim context over the in-process PAL.

#![allow(dead_code)]

use std::sync::Arc;

use graft_pal::{FixedRandom, HostMemory, UserAddressRange};
use graft_shim::brk::BRK_MAX_SIZE_KEY;
use graft_shim::{Config, ShimContext, VmaTree};

/// User range handed to every test process.
pub const USER: UserAddressRange = UserAddressRange::new(0x1000, 0x4000_0000);

pub struct TestEnv {
    pub ctx: Arc<ShimContext>,
    pub vmas: Arc<VmaTree>,
    pub host: Arc<HostMemory>,
}

pub struct TestEnvBuilder {
    max_size: Option<String>,
    aslr: bool,
    seed: Option<u64>,
    host: HostMemory,
}

impl TestEnvBuilder {
    pub fn max_size(mut self, max_size: &str) -> Self {
        self.max_size = Some(max_size.to_string());
        self
    }

    pub fn aslr(mut self, seed: u64) -> Self {
        self.aslr = true;
        self.seed = Some(seed);
        self
    }

    pub fn host(mut self, host: HostMemory) -> Self {
        self.host = host;
        self
    }

    pub fn build(self) -> TestEnv {
        let random = Arc::new(self.seed.map_or(FixedRandom::failing(), FixedRandom::new));
        let vmas = Arc::new(VmaTree::new(USER));
        let host = Arc::new(self.host);

        let mut ctx = ShimContext::new(vmas.clone(), host.clone(), random, USER).with_aslr(self.aslr);
        if let Some(max_size) = self.max_size {
            let mut config = Config::new();
            config.insert(BRK_MAX_SIZE_KEY, &max_size);
            ctx = ctx.with_config(Arc::new(config));
        }

        TestEnv {
            ctx: Arc::new(ctx),
            vmas,
            host,
        }
    }
}

impl TestEnv {
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder {
            max_size: None,
            aslr: false,
            seed: None,
            host: HostMemory::new(),
        }
    }

    /// Default heap size, no ASLR.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// `max_size` heap window, no ASLR.
    pub fn with_max_size(max_size: &str) -> Self {
        Self::builder().max_size(max_size).build()
    }
}
