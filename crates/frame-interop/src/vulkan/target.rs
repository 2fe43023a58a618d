//! Offscreen Vulkan render target and its readback buffer.

use std::ptr;

use anyhow::{ensure, Context, Result};
use ash::vk;
use tracing::debug;

use super::device::VulkanDevice;
use crate::region::Rect;
use crate::transfer::OPAQUE_BLACK;

pub const COLOR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// An image bound to its own allocation, with a view.
#[derive(Debug, Clone, Copy)]
struct Attachment {
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
}

impl Attachment {
    fn create(
        gpu: &VulkanDevice,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let device = gpu.device();
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        unsafe {
            let image = device.create_image(&info, None).context("vkCreateImage")?;
            let requirements = device.get_image_memory_requirements(image);
            let memory = match gpu.allocate(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
                Ok(memory) => memory,
                Err(e) => {
                    device.destroy_image(image, None);
                    return Err(e);
                }
            };
            if let Err(e) = device.bind_image_memory(image, memory, 0) {
                device.free_memory(memory, None);
                device.destroy_image(image, None);
                return Err(e).context("vkBindImageMemory");
            }

            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(subresource_range(aspect));
            let view = match device.create_image_view(&view_info, None) {
                Ok(view) => view,
                Err(e) => {
                    device.free_memory(memory, None);
                    device.destroy_image(image, None);
                    return Err(e).context("vkCreateImageView");
                }
            };
            Ok(Self {
                image,
                memory,
                view,
            })
        }
    }

    fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Host-visible, persistently mapped buffer the colour image is copied into.
#[derive(Debug)]
struct Readback {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped: *const u8,
    size: usize,
}

impl Readback {
    fn create(gpu: &VulkanDevice, size: usize) -> Result<Self> {
        let device = gpu.device();
        let info = vk::BufferCreateInfo::default()
            .size(size as vk::DeviceSize)
            .usage(vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        unsafe {
            let buffer = device.create_buffer(&info, None).context("vkCreateBuffer")?;
            let requirements = device.get_buffer_memory_requirements(buffer);
            let flags = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
            let memory = match gpu.allocate(requirements, flags) {
                Ok(memory) => memory,
                Err(e) => {
                    device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            let mapped = device
                .bind_buffer_memory(buffer, memory, 0)
                .and_then(|()| {
                    device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                });
            match mapped {
                Ok(mapped) => Ok(Self {
                    buffer,
                    memory,
                    mapped: mapped as *const u8,
                    size,
                }),
                Err(e) => {
                    device.free_memory(memory, None);
                    device.destroy_buffer(buffer, None);
                    Err(e).context("Failed to map readback buffer")
                }
            }
        }
    }

    fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.unmap_memory(self.memory);
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Colour and depth/stencil images the renderer draws into, plus the buffer
/// used to read the colour image back.
///
/// The colour image rests in `COLOR_ATTACHMENT_OPTIMAL` and the
/// depth/stencil image in `DEPTH_STENCIL_ATTACHMENT_OPTIMAL` between calls.
#[derive(Debug)]
pub struct VulkanTarget {
    color: Attachment,
    depth_stencil: Attachment,
    readback: Readback,
    width: u32,
    height: u32,
}

// SAFETY: `readback.mapped` points into memory owned by this target and is
// only read while the surface's frame lock is held.
unsafe impl Send for VulkanTarget {}
unsafe impl Sync for VulkanTarget {}

impl VulkanTarget {
    /// Allocate all images at `width` x `height` and clear them (colour to
    /// opaque black, depth to 1, stencil to 0).
    pub fn create(gpu: &VulkanDevice, width: u32, height: u32) -> Result<Self> {
        let device = gpu.device();
        let color = Attachment::create(
            gpu,
            COLOR_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            vk::ImageAspectFlags::COLOR,
            width,
            height,
        )?;
        let depth_stencil = match Attachment::create(
            gpu,
            gpu.depth_stencil_format(),
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            depth_stencil_aspect(),
            width,
            height,
        ) {
            Ok(attachment) => attachment,
            Err(e) => {
                color.destroy(device);
                return Err(e);
            }
        };
        let readback = match Readback::create(gpu, Rect::full(width, height).byte_len()) {
            Ok(readback) => readback,
            Err(e) => {
                depth_stencil.destroy(device);
                color.destroy(device);
                return Err(e);
            }
        };

        let target = Self {
            color,
            depth_stencil,
            readback,
            width,
            height,
        };
        let black = OPAQUE_BLACK.map(|c| f32::from(c) / 255.0);
        let initialized = gpu.submit(|device, cb| {
            target.record_clear(device, cb, Some(black), Some((1.0, 0)))
        });
        if let Err(e) = initialized {
            target.destroy(gpu);
            return Err(e.context("Failed to initialize render target"));
        }

        debug!(width, height, "Vulkan render target created");
        Ok(target)
    }

    pub fn destroy(&self, gpu: &VulkanDevice) {
        let device = gpu.device();
        self.readback.destroy(device);
        self.depth_stencil.destroy(device);
        self.color.destroy(device);
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn color_image(&self) -> vk::Image {
        self.color.image
    }

    pub fn color_view(&self) -> vk::ImageView {
        self.color.view
    }

    pub fn depth_stencil_image(&self) -> vk::Image {
        self.depth_stencil.image
    }

    pub fn depth_stencil_view(&self) -> vk::ImageView {
        self.depth_stencil.view
    }

    /// Clear the selected images and return them to their resting layouts.
    pub fn clear(
        &self,
        gpu: &VulkanDevice,
        color: Option<[f32; 4]>,
        depth_stencil: Option<(f32, u32)>,
    ) -> Result<()> {
        gpu.submit(|device, cb| self.record_clear(device, cb, color, depth_stencil))
    }

    fn record_clear(
        &self,
        device: &ash::Device,
        cb: vk::CommandBuffer,
        color: Option<[f32; 4]>,
        depth_stencil: Option<(f32, u32)>,
    ) {
        // Clears cover whole images, so previous contents are discarded.
        let from = vk::ImageLayout::UNDEFINED;
        if let Some(rgba) = color {
            let range = subresource_range(vk::ImageAspectFlags::COLOR);
            transition(
                device,
                cb,
                self.color.image,
                range,
                (from, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                (vk::AccessFlags::empty(), vk::AccessFlags::TRANSFER_WRITE),
            );
            unsafe {
                device.cmd_clear_color_image(
                    cb,
                    self.color.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &vk::ClearColorValue { float32: rgba },
                    &[range],
                );
            }
            transition(
                device,
                cb,
                self.color.image,
                range,
                (
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ),
                (
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                ),
            );
        }
        if let Some((depth, stencil)) = depth_stencil {
            let range = subresource_range(depth_stencil_aspect());
            transition(
                device,
                cb,
                self.depth_stencil.image,
                range,
                (from, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                (vk::AccessFlags::empty(), vk::AccessFlags::TRANSFER_WRITE),
            );
            unsafe {
                device.cmd_clear_depth_stencil_image(
                    cb,
                    self.depth_stencil.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &vk::ClearDepthStencilValue { depth, stencil },
                    &[range],
                );
            }
            transition(
                device,
                cb,
                self.depth_stencil.image,
                range,
                (
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ),
                (
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                ),
            );
        }
    }

    /// Copy `region` of the colour image into `out` as tightly packed,
    /// top-down RGBA rows.
    pub fn read_back(&self, gpu: &VulkanDevice, region: Rect, out: &mut Vec<u8>) -> Result<()> {
        let len = region.byte_len();
        ensure!(
            len <= self.readback.size,
            "readback region {:?} exceeds the {}x{} target",
            region,
            self.width,
            self.height
        );
        let range = subresource_range(vk::ImageAspectFlags::COLOR);
        let copy = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D {
                x: region.x,
                y: region.y,
                z: 0,
            })
            .image_extent(vk::Extent3D {
                width: region.width,
                height: region.height,
                depth: 1,
            });

        gpu.submit(|device, cb| {
            transition(
                device,
                cb,
                self.color.image,
                range,
                (
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                ),
                (
                    vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                ),
            );
            unsafe {
                device.cmd_copy_image_to_buffer(
                    cb,
                    self.color.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.readback.buffer,
                    &[copy],
                );
            }
            transition(
                device,
                cb,
                self.color.image,
                range,
                (
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ),
                (
                    vk::AccessFlags::TRANSFER_READ,
                    vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                ),
            );
        })?;

        out.resize(len, 0);
        // SAFETY: the buffer is host-coherent, mapped for its whole size
        // (checked above) and the fence wait in `submit` ordered the copy
        // before this read.
        unsafe { ptr::copy_nonoverlapping(self.readback.mapped, out.as_mut_ptr(), len) };
        Ok(())
    }
}

fn depth_stencil_aspect() -> vk::ImageAspectFlags {
    vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
}

fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn transition(
    device: &ash::Device,
    cb: vk::CommandBuffer,
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    (old_layout, new_layout): (vk::ImageLayout, vk::ImageLayout),
    (src_access, dst_access): (vk::AccessFlags, vk::AccessFlags),
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);
    unsafe {
        device.cmd_pipeline_barrier(
            cb,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}
