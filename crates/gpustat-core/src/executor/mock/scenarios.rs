//! Pre-built device setups for testing.
//!
//! Raw values mimic `nvidia-smi --format=csv,noheader,nounits` output.

use super::executor::MockExecutor;

#[allow(dead_code)]
impl MockExecutor {
    /// Two consumer GPUs.
    ///
    /// Device 1 reports total memory with a decimal point, and the listing
    /// prints devices out of order.
    pub fn two_gpus() -> Self {
        Self::new()
            .with_device(
                0,
                &[
                    ("name", "NVIDIA GeForce RTX 3090"),
                    ("memory.total", "24576"),
                    ("memory.used", "2048"),
                    ("memory.free", "22528"),
                    ("utilization.gpu", "35"),
                    ("power.draw", "112.34"),
                    ("temperature.gpu", "54"),
                    ("fan.speed", "41"),
                    ("power.max_limit", "350.00"),
                ],
            )
            .with_device(
                1,
                &[
                    ("name", "NVIDIA GeForce RTX 3070"),
                    ("memory.total", "8192.0"),
                    ("memory.used", "2048"),
                    ("memory.free", "6144"),
                    ("utilization.gpu", "0"),
                    ("power.draw", "15.20"),
                    ("temperature.gpu", "38"),
                    ("fan.speed", "30"),
                    ("power.max_limit", "220.00"),
                ],
            )
            .with_listing("1\n0\n")
    }

    /// A single passively cooled datacenter GPU. Fan speed is unavailable.
    pub fn single_gpu() -> Self {
        Self::new().with_device(
            0,
            &[
                ("name", "Tesla T4"),
                ("memory.total", "15360"),
                ("memory.used", "512"),
                ("memory.free", "14848"),
                ("utilization.gpu", "12"),
                ("power.draw", "27.83"),
                ("temperature.gpu", "47"),
                ("fan.speed", "[N/A]"),
                ("power.max_limit", "70.00"),
            ],
        )
    }
}
