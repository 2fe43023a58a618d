//! Vulkan instance, device and the single command buffer used for
//! one-shot work (clears, layout transitions, readback copies).

use anyhow::{bail, Context, Result};
use ash::vk;
use tracing::{debug, info, warn};

/// Depth/stencil formats in order of preference.
const DEPTH_STENCIL_FORMATS: [vk::Format; 2] = [
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
];

/// Logical device with one graphics queue.
///
/// Command recording is externally synchronised: callers hold the surface's
/// frame lock around [`VulkanDevice::submit`].
pub struct VulkanDevice {
    // Must outlive the instance.
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    depth_stencil_format: vk::Format,
    name: String,
    api_version: u32,
}

// SAFETY: the command buffer, fence and queue are only used from `submit`,
// which callers serialise; everything else is immutable after creation.
unsafe impl Send for VulkanDevice {}
unsafe impl Sync for VulkanDevice {}

impl VulkanDevice {
    /// Load the Vulkan loader and create a device on the first physical
    /// device that exposes a graphics queue.
    pub fn new() -> Result<Self> {
        unsafe {
            let entry = ash::Entry::load().context("Failed to load the Vulkan loader")?;

            let app_info = vk::ApplicationInfo::default()
                .application_name(c"frame-interop")
                .application_version(vk::make_api_version(0, 0, 1, 0))
                .engine_name(c"frame-interop")
                .api_version(vk::API_VERSION_1_1);
            let instance_info = vk::InstanceCreateInfo::default().application_info(&app_info);
            let instance = entry
                .create_instance(&instance_info, None)
                .context("vkCreateInstance")?;

            match Self::with_instance(entry, instance.clone()) {
                Ok(device) => Ok(device),
                Err(e) => {
                    instance.destroy_instance(None);
                    Err(e)
                }
            }
        }
    }

    unsafe fn with_instance(entry: ash::Entry, instance: ash::Instance) -> Result<Self> {
        let (physical_device, queue_family_index) = select_physical_device(&instance)?;
        let properties = instance.get_physical_device_properties(physical_device);
        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown Vulkan device".to_string());

        let depth_stencil_format = DEPTH_STENCIL_FORMATS
            .into_iter()
            .find(|&format| {
                instance
                    .get_physical_device_format_properties(physical_device, format)
                    .optimal_tiling_features
                    .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            })
            .context("No supported depth/stencil format")?;

        let priorities = [1.0_f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities);
        let device_info =
            vk::DeviceCreateInfo::default().queue_create_infos(std::slice::from_ref(&queue_info));
        let device = instance
            .create_device(physical_device, &device_info, None)
            .context("vkCreateDevice")?;
        let queue = device.get_device_queue(queue_family_index, 0);

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = match device.create_command_pool(&pool_info, None) {
            Ok(pool) => pool,
            Err(e) => {
                device.destroy_device(None);
                return Err(e).context("vkCreateCommandPool");
            }
        };

        let buffer_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match device.allocate_command_buffers(&buffer_info) {
            Ok(buffers) if !buffers.is_empty() => buffers[0],
            result => {
                device.destroy_command_pool(command_pool, None);
                device.destroy_device(None);
                return match result {
                    Err(e) => Err(e).context("vkAllocateCommandBuffers"),
                    Ok(_) => bail!("vkAllocateCommandBuffers returned no buffer"),
                };
            }
        };

        let fence = match device.create_fence(&vk::FenceCreateInfo::default(), None) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_command_pool(command_pool, None);
                device.destroy_device(None);
                return Err(e).context("vkCreateFence");
            }
        };

        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        info!(
            device = %name,
            queue_family = queue_family_index,
            ?depth_stencil_format,
            "Vulkan device created"
        );

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            queue,
            queue_family_index,
            command_pool,
            command_buffer,
            fence,
            memory_properties,
            depth_stencil_format,
            name,
            api_version: properties.api_version,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
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

    pub fn depth_stencil_format(&self) -> vk::Format {
        self.depth_stencil_format
    }

    /// Physical device name as reported by the driver.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version_string(&self) -> String {
        format!(
            "Vulkan {}.{}.{}",
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version)
        )
    }

    /// Allocate device memory satisfying `requirements` with `flags`.
    pub fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory> {
        let memory_type = find_memory_type(&self.memory_properties, requirements.memory_type_bits, flags)
            .with_context(|| format!("No memory type with {flags:?}"))?;
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        unsafe { self.device.allocate_memory(&info, None) }.context("vkAllocateMemory")
    }

    /// Record with `record`, submit, and wait for completion.
    pub fn submit(&self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> Result<()> {
        let device = &self.device;
        let cb = self.command_buffer;
        unsafe {
            device
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
                .context("vkResetCommandBuffer")?;
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cb, &begin)
                .context("vkBeginCommandBuffer")?;
            record(device, cb);
            device.end_command_buffer(cb).context("vkEndCommandBuffer")?;

            let submit = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cb));
            device
                .queue_submit(self.queue, std::slice::from_ref(&submit), self.fence)
                .context("vkQueueSubmit")?;
            let waited = device.wait_for_fences(&[self.fence], true, u64::MAX);
            device
                .reset_fences(&[self.fence])
                .context("vkResetFences")?;
            waited.context("vkWaitForFences")?;
        }
        Ok(())
    }

    pub fn wait_idle(&self) {
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            warn!("vkDeviceWaitIdle failed: {e}");
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_fence(self.fence, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        debug!("Vulkan device destroyed");
    }
}

unsafe fn select_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
    let devices = instance
        .enumerate_physical_devices()
        .context("vkEnumeratePhysicalDevices")?;

    let mut fallback = None;
    for device in devices {
        let families = instance.get_physical_device_queue_family_properties(device);
        let Some(index) = families
            .iter()
            .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        else {
            continue;
        };
        let kind = instance.get_physical_device_properties(device).device_type;
        if matches!(
            kind,
            vk::PhysicalDeviceType::DISCRETE_GPU | vk::PhysicalDeviceType::INTEGRATED_GPU
        ) {
            return Ok((device, index as u32));
        }
        fallback.get_or_insert((device, index as u32));
    }
    fallback.context("No Vulkan device with a graphics queue")
}

/// Index of the first memory type allowed by `type_bits` that has all of
/// `flags`.
pub(crate) fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = (properties.memory_type_count as usize).min(properties.memory_types.len());
    properties.memory_types[..count]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            type_bits & (1 << index) != 0 && memory_type.property_flags.contains(flags)
        })
        .map(|(index, _)| index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        properties.memory_type_count = types.len() as u32;
        for (slot, &flags) in properties.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        properties
    }

    #[test]
    fn memory_type_respects_flags_and_mask() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let props = properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL, host, host]);

        assert_eq!(find_memory_type(&props, 0b111, host), Some(1));
        assert_eq!(find_memory_type(&props, 0b100, host), Some(2));
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
        assert_eq!(find_memory_type(&props, 0b001, host), None);
    }

    #[test]
    fn memory_type_ignores_entries_past_count() {
        let mut props = properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        props.memory_types[1].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert_eq!(
            find_memory_type(&props, u32::MAX, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }
}
