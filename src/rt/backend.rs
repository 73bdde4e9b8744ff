//! Device/queue/command-pool lifecycle, capability probing, and the safety
//! policy that gates half-precision and subgroup-size-controlled dispatch
//! on known-bad driver/device pairs.
//!
//! Grounded on `original_source/src/rt/backend/vulkan/{include,src}/backend.{hpp,cpp}`.
//! The reference resolves its safety knobs from `GRETA_VK_*`-prefixed
//! environment variables; this port exposes the unprefixed names from
//! `spec.md` §6.4 (`VK_ALLOW_UNSAFE`, `VK_FP16_ALLOW_UNSAFE`) as the public
//! surface, see DESIGN.md for the reconciliation.

use ash::vk;
use std::ffi::{CStr, CString};
use tracing::{info, warn};

use crate::utils::{CoreError, Result};

/// The one known-bad (driver, device) pair the reference implementation
/// hard-codes: RADV reporting a device name containing "GFX1103".
const BLACKLISTED_DRIVER_SUBSTR: &str = "RADV";
const BLACKLISTED_DEVICE_SUBSTR: &str = "GFX1103";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyState {
    /// Full feature set available.
    Normal,
    /// Half-precision disabled; subgroup-size-controlled dispatch refused;
    /// FP16 GEMM initialization fails.
    SafeMode,
    /// All compute initialization fails.
    Blacklisted,
}

#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_name: String,
    pub driver_name: String,
    pub subgroup_size_reported: u32,
    pub subgroup_size_min: u32,
    pub subgroup_size_max: u32,
    pub subgroup_size_control: bool,
    pub fp16_storage: bool,
    pub fp16_arithmetic: bool,
    pub robust_buffer_access: bool,
}

impl DeviceCapabilities {
    /// The device-key string format consumed by the autotuner cache:
    /// `vid=HEX;did=HEX;name=STR;driver=STR;sg=(reported,min,max)`.
    pub fn device_key(&self) -> String {
        format!(
            "vid={:#06x};did={:#06x};name={};driver={};sg=({},{},{})",
            self.vendor_id,
            self.device_id,
            self.device_name,
            self.driver_name,
            self.subgroup_size_reported,
            self.subgroup_size_min,
            self.subgroup_size_max
        )
    }

    fn is_known_bad_pair(&self) -> bool {
        self.driver_name.contains(BLACKLISTED_DRIVER_SUBSTR)
            && self.device_name.contains(BLACKLISTED_DEVICE_SUBSTR)
    }
}

/// Safety policy resolved from [`DeviceCapabilities`] and environment
/// overrides (`spec.md` §4.3/§6.4).
pub fn resolve_safety_state(caps: &DeviceCapabilities) -> SafetyState {
    // CLI-only override (`--safe-mode`, `SPEC_FULL.md` §6.3) for exercising
    // the safe-mode path without a blacklisted device present.
    if std::env::var("EXSA_FORCE_SAFE_MODE").as_deref() == Ok("1") {
        return SafetyState::SafeMode;
    }
    if !caps.is_known_bad_pair() {
        return SafetyState::Normal;
    }
    if std::env::var("VK_ALLOW_UNSAFE").as_deref() == Ok("1") {
        return SafetyState::Normal;
    }
    // A second override promotes safe mode to an outright blacklist.
    if std::env::var("VK_BLACKLIST_OVERRIDE_UNSAFE").as_deref() == Ok("1") {
        warn!(device = %caps.device_name, "known-bad device pair, overriding safe mode with an outright blacklist via VK_BLACKLIST_OVERRIDE_UNSAFE");
        return SafetyState::Blacklisted;
    }
    warn!(
        device = %caps.device_name,
        driver = %caps.driver_name,
        "known-bad (driver, device) pair detected, entering safe mode"
    );
    SafetyState::SafeMode
}

/// Logical device, compute queue and command pool wrapping a single
/// physical device selection, plus the resolved capability/safety state.
pub struct Backend {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    command_pool: vk::CommandPool,
    capabilities: DeviceCapabilities,
    safety: SafetyState,
}

impl Backend {
    /// Enumerate physical devices, prefer a non-software one with a compute
    /// queue family, probe its capabilities, and apply the safety policy.
    ///
    /// # Safety
    /// Calls into the Vulkan loader via `ash`; requires a usable ICD.
    pub unsafe fn new() -> Result<Self> {
        let entry = ash::Entry::load()
            .map_err(|e| CoreError::Device(format!("failed to load Vulkan loader: {e}")))?;

        let app_name = CString::new("exsa-core").unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);
        let instance_info = vk::InstanceCreateInfo::builder().application_info(&app_info);
        let instance = entry
            .create_instance(&instance_info, None)
            .map_err(|e| CoreError::Device(format!("vkCreateInstance failed: {e}")))?;

        let physical_devices = instance
            .enumerate_physical_devices()
            .map_err(|e| CoreError::Device(format!("vkEnumeratePhysicalDevices failed: {e}")))?;
        if physical_devices.is_empty() {
            return Err(CoreError::Device("no Vulkan physical devices found".into()));
        }

        let (physical_device, queue_family_index) =
            select_physical_device(&instance, &physical_devices)?;

        let capabilities = probe_capabilities(&instance, physical_device);
        let safety = resolve_safety_state(&capabilities);
        if safety == SafetyState::Blacklisted {
            return Err(CoreError::Skipped(format!(
                "device {} is blacklisted for compute init",
                capabilities.device_name
            )));
        }

        let queue_priority = [1.0f32];
        let queue_info = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priority)
            .build()];
        let device_info = vk::DeviceCreateInfo::builder().queue_create_infos(&queue_info);
        let device = instance
            .create_device(physical_device, &device_info, None)
            .map_err(|e| CoreError::Device(format!("vkCreateDevice failed: {e}")))?;
        let queue = device.get_device_queue(queue_family_index, 0);

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = device
            .create_command_pool(&pool_info, None)
            .map_err(|e| CoreError::Device(format!("vkCreateCommandPool failed: {e}")))?;

        info!(device = %capabilities.device_name, safety = ?safety, "backend initialized");

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            queue,
            queue_family_index,
            command_pool,
            capabilities,
            safety,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// # Safety
    /// Queries the instance for the bound physical device's memory layout.
    pub unsafe fn instance_memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.instance.get_physical_device_memory_properties(self.physical_device)
    }

    pub fn safety_state(&self) -> SafetyState {
        self.safety
    }

    pub fn fp16_allowed(&self) -> bool {
        if std::env::var("VK_FORCE_FP32").as_deref() == Ok("1")
            || std::env::var("VK_DISABLE_FP16").as_deref() == Ok("1")
        {
            return false;
        }
        self.safety == SafetyState::Normal && self.capabilities.fp16_arithmetic
    }

    pub fn subgroup_control_allowed(&self) -> bool {
        self.safety == SafetyState::Normal && self.capabilities.subgroup_size_control
    }

    /// Allocate a primary command buffer, begin/end it empty, submit, and
    /// wait for queue idle. Returns wall-clock nanoseconds from submit to
    /// idle (`spec.md` §4.3 `empty_submit`).
    ///
    /// # Safety
    /// Issues raw Vulkan calls against `self.device`/`self.queue`.
    pub unsafe fn empty_submit(&self) -> Result<u64> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = self
            .device
            .allocate_command_buffers(&alloc_info)
            .map_err(|e| CoreError::Device(format!("allocate_command_buffers failed: {e}")))?[0];

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.device
            .begin_command_buffer(cmd, &begin_info)
            .map_err(|e| CoreError::Device(format!("begin_command_buffer failed: {e}")))?;
        self.device
            .end_command_buffer(cmd)
            .map_err(|e| CoreError::Device(format!("end_command_buffer failed: {e}")))?;

        let cmds = [cmd];
        let submit = vk::SubmitInfo::builder().command_buffers(&cmds).build();
        let start = super::telemetry::now_ns();
        self.device
            .queue_submit(self.queue, &[submit], vk::Fence::null())
            .map_err(|e| CoreError::Device(format!("queue_submit failed: {e}")))?;
        self.device
            .queue_wait_idle(self.queue)
            .map_err(|e| CoreError::Device(format!("queue_wait_idle failed: {e}")))?;
        let elapsed = super::telemetry::now_ns().saturating_sub(start);

        self.device.free_command_buffers(self.command_pool, &cmds);
        Ok(elapsed)
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

unsafe fn select_physical_device(
    instance: &ash::Instance,
    devices: &[vk::PhysicalDevice],
) -> Result<(vk::PhysicalDevice, u32)> {
    let mut fallback: Option<(vk::PhysicalDevice, u32)> = None;
    for &pd in devices {
        let props = instance.get_physical_device_properties(pd);
        let queue_families = instance.get_physical_device_queue_family_properties(pd);
        let compute_family = queue_families
            .iter()
            .position(|qf| qf.queue_flags.contains(vk::QueueFlags::COMPUTE))
            .map(|i| i as u32);
        let Some(family) = compute_family else { continue };

        if props.device_type != vk::PhysicalDeviceType::CPU {
            return Ok((pd, family));
        }
        if fallback.is_none() {
            fallback = Some((pd, family));
        }
    }
    fallback.ok_or_else(|| CoreError::Device("no device exposes a compute queue family".into()))
}

unsafe fn probe_capabilities(instance: &ash::Instance, pd: vk::PhysicalDevice) -> DeviceCapabilities {
    let props = instance.get_physical_device_properties(pd);
    let device_name = CStr::from_ptr(props.device_name.as_ptr())
        .to_string_lossy()
        .into_owned();

    let mut subgroup_props = vk::PhysicalDeviceSubgroupProperties::default();
    let mut driver_props = vk::PhysicalDeviceDriverProperties::default();
    let mut subgroup_size_control_props = vk::PhysicalDeviceSubgroupSizeControlProperties::default();
    let mut props2 = vk::PhysicalDeviceProperties2::builder()
        .push_next(&mut subgroup_props)
        .push_next(&mut driver_props)
        .push_next(&mut subgroup_size_control_props);
    instance.get_physical_device_properties2(pd, &mut props2);

    let driver_name = CStr::from_ptr(driver_props.driver_name.as_ptr())
        .to_string_lossy()
        .into_owned();
    let driver_name = if driver_name.is_empty() {
        String::from("unknown")
    } else {
        driver_name
    };

    let mut features16 = vk::PhysicalDevice16BitStorageFeatures::default();
    let mut features_f16_i8 = vk::PhysicalDeviceShaderFloat16Int8Features::default();
    let mut subgroup_size_control_features = vk::PhysicalDeviceSubgroupSizeControlFeatures::default();
    let mut robustness = vk::PhysicalDeviceFeatures2::builder()
        .push_next(&mut features16)
        .push_next(&mut features_f16_i8)
        .push_next(&mut subgroup_size_control_features);
    instance.get_physical_device_features2(pd, &mut robustness);

    DeviceCapabilities {
        vendor_id: props.vendor_id,
        device_id: props.device_id,
        device_name,
        driver_name,
        subgroup_size_reported: subgroup_props.subgroup_size,
        subgroup_size_min: subgroup_size_control_props.min_subgroup_size,
        subgroup_size_max: subgroup_size_control_props.max_subgroup_size,
        subgroup_size_control: subgroup_size_control_features.subgroup_size_control == vk::TRUE,
        fp16_storage: features16.storage_buffer16_bit_access == vk::TRUE,
        fp16_arithmetic: features_f16_i8.shader_float16 == vk::TRUE,
        robust_buffer_access: robustness.features.robust_buffer_access == vk::TRUE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(driver: &str, name: &str) -> DeviceCapabilities {
        DeviceCapabilities {
            vendor_id: 0x1002,
            device_id: 0x1,
            device_name: name.to_string(),
            driver_name: driver.to_string(),
            subgroup_size_reported: 64,
            subgroup_size_min: 32,
            subgroup_size_max: 64,
            subgroup_size_control: true,
            fp16_storage: true,
            fp16_arithmetic: true,
            robust_buffer_access: true,
        }
    }

    #[test]
    fn device_key_format() {
        let c = caps("RADV", "AMD Radeon");
        assert_eq!(
            c.device_key(),
            "vid=0x1002;did=0x0001;name=AMD Radeon;driver=RADV;sg=(64,32,64)"
        );
    }

    #[test]
    fn normal_pair_is_not_flagged() {
        let c = caps("RADV", "AMD Radeon RX 6800");
        assert_eq!(resolve_safety_state(&c), SafetyState::Normal);
    }

    #[test]
    fn known_bad_pair_enters_safe_mode() {
        std::env::remove_var("VK_ALLOW_UNSAFE");
        std::env::remove_var("VK_BLACKLIST_OVERRIDE_UNSAFE");
        let c = caps("RADV", "AMD Radeon GFX1103");
        assert_eq!(resolve_safety_state(&c), SafetyState::SafeMode);
    }

    #[test]
    fn allow_unsafe_override_restores_normal() {
        std::env::set_var("VK_ALLOW_UNSAFE", "1");
        let c = caps("RADV", "AMD Radeon GFX1103");
        assert_eq!(resolve_safety_state(&c), SafetyState::Normal);
        std::env::remove_var("VK_ALLOW_UNSAFE");
    }

    #[test]
    fn force_safe_mode_override_applies_to_any_device() {
        std::env::set_var("EXSA_FORCE_SAFE_MODE", "1");
        let c = caps("NVIDIA", "GeForce RTX 4090");
        assert_eq!(resolve_safety_state(&c), SafetyState::SafeMode);
        std::env::remove_var("EXSA_FORCE_SAFE_MODE");
    }

    #[test]
    fn blacklist_override_escalates_past_safe_mode() {
        std::env::remove_var("VK_ALLOW_UNSAFE");
        std::env::set_var("VK_BLACKLIST_OVERRIDE_UNSAFE", "1");
        let c = caps("RADV", "AMD Radeon GFX1103");
        assert_eq!(resolve_safety_state(&c), SafetyState::Blacklisted);
        std::env::remove_var("VK_BLACKLIST_OVERRIDE_UNSAFE");
    }
}
