use ash::vk;
use smallvec::SmallVec;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufDesc {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
}

impl BufDesc {
    ///Storage buffer that can be used as transfer source and destination.
    pub fn storage(size: u64) -> Self {
        BufDesc {
            size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST,
        }
    }

    pub fn with_usage(mut self, usage: vk::BufferUsageFlags) -> Self {
        self.usage |= usage;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageType {
    Tex1d,
    Tex2d,
    Tex3d,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImgDesc {
    pub img_type: ImageType,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
}

impl ImgDesc {
    pub fn texture_2d(width: u32, height: u32, format: vk::Format) -> Self {
        ImgDesc {
            img_type: ImageType::Tex2d,
            format,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        }
    }

    ///2D image that can be rendered to, sampled and copied from.
    pub fn color_attachment_2d(width: u32, height: u32, format: vk::Format) -> Self {
        ImgDesc {
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC,
            ..Self::texture_2d(width, height, format)
        }
    }

    pub fn depth_attachment_2d(width: u32, height: u32, format: vk::Format) -> Self {
        ImgDesc {
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            ..Self::texture_2d(width, height, format)
        }
    }

    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    pub fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage |= usage;
        self
    }

    ///Aspect that is touched when the whole image is used.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        match self.format {
            vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
                vk::ImageAspectFlags::DEPTH
            }
            vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }
            _ => vk::ImageAspectFlags::COLOR,
        }
    }

    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
    pub max_anisotropy: Option<f32>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        SamplerDesc {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            max_anisotropy: None,
        }
    }
}

///Acceleration structure allocation. Sizes are usually queried from the geometry beforehand by the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccelerationStructureDesc {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub size: u64,
    pub build_scratch_size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AsGeometry {
    Triangles {
        vertices: vk::Buffer,
        vertex_stride: u64,
        vertex_count: u32,
        indices: Option<vk::Buffer>,
        primitive_count: u32,
    },
    Instances {
        instances: vk::Buffer,
        count: u32,
        blas: SmallVec<[vk::AccelerationStructureKHR; 4]>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AsBuildInfo {
    pub dst: vk::AccelerationStructureKHR,
    pub ty: vk::AccelerationStructureTypeKHR,
    pub geometry: AsGeometry,
    pub scratch: vk::Buffer,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub image_count: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}

impl Default for SwapchainDesc {
    fn default() -> Self {
        SwapchainDesc {
            width: 1,
            height: 1,
            image_count: 3,
            format: vk::Format::B8G8R8A8_SRGB,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    Image {
        image: vk::Image,
        layout: vk::ImageLayout,
    },
    Sampler(vk::Sampler),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub array_element: u32,
    pub ty: vk::DescriptorType,
    pub resources: SmallVec<[DescriptorResource; 1]>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineDesc {
    pub vertex: vk::ShaderModule,
    pub fragment: Option<vk::ShaderModule>,
    pub vertex_bindings: Vec<VertexBinding>,
    pub vertex_attributes: Vec<VertexAttribute>,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    pub depth_compare: Option<vk::CompareOp>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RayTracingPipelineDesc {
    pub raygen: vk::ShaderModule,
    pub miss: Vec<vk::ShaderModule>,
    pub closest_hit: Vec<vk::ShaderModule>,
    pub max_recursion: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PipelineDesc {
    Graphics(GraphicsPipelineDesc),
    Compute { shader: vk::ShaderModule },
    RayTracing(RayTracingPipelineDesc),
}

impl PipelineDesc {
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self {
            PipelineDesc::Graphics(_) => vk::PipelineBindPoint::GRAPHICS,
            PipelineDesc::Compute { .. } => vk::PipelineBindPoint::COMPUTE,
            PipelineDesc::RayTracing(_) => vk::PipelineBindPoint::RAY_TRACING_KHR,
        }
    }

    ///Shader stages that can observe resources bound to this pipeline.
    pub fn stages(&self) -> vk::ShaderStageFlags {
        match self {
            PipelineDesc::Graphics(g) => {
                if g.fragment.is_some() {
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
                } else {
                    vk::ShaderStageFlags::VERTEX
                }
            }
            PipelineDesc::Compute { .. } => vk::ShaderStageFlags::COMPUTE,
            PipelineDesc::RayTracing(_) => {
                vk::ShaderStageFlags::RAYGEN_KHR
                    | vk::ShaderStageFlags::MISS_KHR
                    | vk::ShaderStageFlags::CLOSEST_HIT_KHR
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderingAttachment {
    pub image: vk::Image,
    pub range: crate::SubresourceRange,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear: Option<ClearValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderingInfo {
    pub width: u32,
    pub height: u32,
    pub color: SmallVec<[RenderingAttachment; 4]>,
    pub depth: Option<RenderingAttachment>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BufferCopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

///Copy from a tightly packed buffer region into one mip level of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferImageCopyRegion {
    pub buffer_offset: u64,
    pub aspect: vk::ImageAspectFlags,
    pub mip: u32,
    pub base_layer: u32,
    pub layer_count: u32,
    pub offset: [i32; 3],
    pub extent: [u32; 3],
}

impl BufferImageCopyRegion {
    pub fn range(&self) -> crate::SubresourceRange {
        crate::SubresourceRange {
            aspect: self.aspect,
            base_mip: self.mip,
            mip_count: 1,
            base_layer: self.base_layer,
            layer_count: self.layer_count,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreSubmit {
    pub semaphore: vk::Semaphore,
    ///Ignored for binary semaphores.
    pub value: u64,
    pub stage: vk::PipelineStageFlags2,
}

///Single queue submission. Either part can be empty, a submission without command lists only
/// waits and signals.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitInfo<'a> {
    pub waits: &'a [SemaphoreSubmit],
    pub command_lists: &'a [vk::CommandBuffer],
    pub signals: &'a [SemaphoreSubmit],
}
