//! WSI swapchain: thin wrapper over `VK_KHR_swapchain`, owning the
//! non-owning [`crate::resources::Image`] wrappers for each presentable
//! image and the acquire/present bookkeeping the device facade drives.

use ash::vk;

use crate::cookie::CookieAllocator;
use crate::error::DeviceError;
use crate::format::Format;
use crate::handle::{HasCookie, Handle};
use crate::resources::image::{Image, ImageCreateInfo, ViewFormats};
use crate::resources::{image::ImageMiscFlags, SharingMode};

pub struct Swapchain {
    loader: ash::khr::swapchain::Device,
    raw: vk::SwapchainKHR,
    images: Vec<Handle<Image>>,
    format: Format,
    extent: vk::Extent2D,
    current_index: Option<u32>,
}

impl Swapchain {
    /// Builds a new swapchain (or recreates one, passing the old handle as
    /// `old_swapchain` so the driver can hand resources over without a
    /// visible flicker).
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        instance: &ash::Instance,
        device: &ash::Device,
        surface: vk::SurfaceKHR,
        format: Format,
        color_space: vk::ColorSpaceKHR,
        extent: vk::Extent2D,
        image_count: u32,
        present_mode: vk::PresentModeKHR,
        pre_transform: vk::SurfaceTransformFlagsKHR,
        composite_alpha: vk::CompositeAlphaFlagsKHR,
        old_swapchain: vk::SwapchainKHR,
        cookies: &CookieAllocator,
    ) -> Result<Swapchain, DeviceError> {
        let loader = ash::khr::swapchain::Device::new(instance, device);
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.to_vk())
            .image_color_space(color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(composite_alpha)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let raw = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|_| DeviceError::UnsupportedFeature("vkCreateSwapchainKHR failed").log())?;
        let raw_images = unsafe { loader.get_swapchain_images(raw) }
            .map_err(|_| DeviceError::UnsupportedFeature("vkGetSwapchainImagesKHR failed").log())?;

        let info = ImageCreateInfo {
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            image_type: vk::ImageType::TYPE_2D,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            sharing: SharingMode::Exclusive(0),
            view_formats: ViewFormats::Identity,
            misc: ImageMiscFlags::empty(),
        };

        let images = raw_images
            .into_iter()
            .map(|raw_image| {
                let image = Image::from_swapchain(cookies.next(), raw_image, info.clone());
                Handle::new(image.cookie(), image, |_image: Image| {
                    // swapchain images are destroyed wholesale by
                    // vkDestroySwapchainKHR; the per-image wrapper's
                    // deleter is therefore a no-op.
                })
            })
            .collect();

        Ok(Swapchain {
            loader,
            raw,
            images,
            format,
            extent,
            current_index: None,
        })
    }

    /// Wraps a swapchain whose `VkSwapchainKHR` and images this crate does
    /// not own -- vended by a compositor or XR runtime instead of created
    /// through `vkCreateSwapchainKHR` here. `destroy` must not be called on
    /// the result; the caller retains ownership.
    pub fn from_external(
        loader: ash::khr::swapchain::Device,
        raw: vk::SwapchainKHR,
        raw_images: &[vk::Image],
        format: Format,
        extent: vk::Extent2D,
        cookies: &CookieAllocator,
    ) -> Swapchain {
        let info = ImageCreateInfo {
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            image_type: vk::ImageType::TYPE_2D,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            sharing: SharingMode::Exclusive(0),
            view_formats: ViewFormats::Identity,
            misc: ImageMiscFlags::empty(),
        };

        let images = raw_images
            .iter()
            .map(|&raw_image| {
                let image = Image::from_swapchain(cookies.next(), raw_image, info.clone());
                Handle::new(image.cookie(), image, |_image: Image| {})
            })
            .collect();

        Swapchain {
            loader,
            raw,
            images,
            format,
            extent,
            current_index: None,
        }
    }

    pub fn raw(&self) -> vk::SwapchainKHR {
        self.raw
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image(&self, index: u32) -> &Handle<Image> {
        &self.images[index as usize]
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Acquires the next presentable image, signaling `acquire_semaphore`
    /// once it's ready. Returns `None` (caller should recreate) if the
    /// surface is out of date.
    pub fn acquire_next_image(&mut self, acquire_semaphore: vk::Semaphore, timeout_ns: u64) -> Option<u32> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.raw, timeout_ns, acquire_semaphore, vk::Fence::null())
        };
        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::warn!("swapchain image acquired suboptimally; recreation recommended");
                }
                self.current_index = Some(index);
                let _ = self.images[index as usize].cookie();
                Some(index)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => None,
            Err(e) => {
                log::error!("vkAcquireNextImageKHR failed: {e:?}");
                None
            }
        }
    }

    /// Presents the currently acquired image, waiting on `wait_semaphore`
    /// (the batch's WSI-release signal). Returns `false` if the surface is
    /// out of date or suboptimal, in which case the caller should recreate.
    pub fn present(&mut self, queue: vk::Queue, wait_semaphore: vk::Semaphore) -> bool {
        let Some(index) = self.current_index.take() else {
            return true;
        };
        let swapchains = [self.raw];
        let indices = [index];
        let waits = [wait_semaphore];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => !suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => false,
            Err(e) => {
                log::error!("vkQueuePresentKHR failed: {e:?}");
                false
            }
        }
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        let _ = device;
        unsafe { self.loader.destroy_swapchain(self.raw, None) };
        self.images.clear();
    }
}
