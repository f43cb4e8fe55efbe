cfg_if::cfg_if! {
    if #[cfg(feature = "tch")] {
        pub type Backend = burn_tch::LibTorch<f32>;
        pub type Device = burn_tch::LibTorchDevice;

        pub fn default_device() -> Device {
            burn_tch::LibTorchDevice::Cuda(0)
        }
    } else {
        pub type Backend = burn::backend::NdArray<f32>;
        pub type Device = burn::backend::ndarray::NdArrayDevice;

        pub fn default_device() -> Device {
            burn::backend::ndarray::NdArrayDevice::Cpu
        }
    }
}
