//! Recorded commands. A command only carries handles and parameters, all synchronisation is derived
//! when the batch is executed.

use marpii_native::{
    ash::vk,
    desc::{BufferCopyRegion, BufferImageCopyRegion, ClearValue, PipelineDesc},
};
use smallvec::SmallVec;

use crate::resources::{
    handle::{
        BlasHandle, BufferHandle, DependencyHandle, DescriptorArrayHandle, ImageHandle,
        SamplerHandle, SwapchainHandle, TlasHandle,
    },
    res_states::ImageKey,
};

///Resource bound to a shader binding.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BoundResource {
    StorageBuffer(BufferHandle),
    UniformBuffer(BufferHandle),
    SampledImage(ImageHandle),
    StorageImage(ImageHandle),
    Sampler(SamplerHandle),
    CombinedImageSampler(ImageHandle, SamplerHandle),
    AccelerationStructure(TlasHandle),
    ///Binds the whole array to the binding.
    DescriptorArray(DescriptorArrayHandle),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Binding {
    pub set: u32,
    pub binding: u32,
    pub resource: BoundResource,
}

///Pipeline and everything that is bound to it for a draw, dispatch or trace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderInput {
    pub pipeline: PipelineDesc,
    pub bindings: Vec<Binding>,
    pub push_constants: Vec<u8>,
}

impl ShaderInput {
    pub fn new(pipeline: PipelineDesc) -> Self {
        ShaderInput {
            pipeline,
            bindings: Vec::new(),
            push_constants: Vec::new(),
        }
    }

    pub fn bind(mut self, set: u32, binding: u32, resource: BoundResource) -> Self {
        self.bindings.push(Binding {
            set,
            binding,
            resource,
        });
        self
    }

    pub fn with_push_constants(mut self, data: &[u8]) -> Self {
        self.push_constants = data.to_vec();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexBuffer {
    pub buffer: BufferHandle,
    pub offset: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexBuffer {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub index_type: vk::IndexType,
}

///Parameters of a single instanced draw. `count` is the vertex count for non-indexed draws, and the index count otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DrawCall {
    pub input: ShaderInput,
    pub vertex_buffers: SmallVec<[VertexBuffer; 2]>,
    pub index_buffer: Option<IndexBuffer>,
    pub count: u32,
    pub instance_count: u32,
    pub first: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

impl DrawCall {
    pub fn new(input: ShaderInput, count: u32, instance_count: u32) -> Self {
        DrawCall {
            input,
            vertex_buffers: SmallVec::new(),
            index_buffer: None,
            count,
            instance_count,
            first: 0,
            vertex_offset: 0,
            first_instance: 0,
        }
    }

    pub fn with_vertex_buffer(mut self, buffer: BufferHandle, offset: u64) -> Self {
        self.vertex_buffers.push(VertexBuffer { buffer, offset });
        self
    }

    pub fn with_index_buffer(
        mut self,
        buffer: BufferHandle,
        offset: u64,
        index_type: vk::IndexType,
    ) -> Self {
        self.index_buffer = Some(IndexBuffer {
            buffer,
            offset,
            index_type,
        });
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AttachmentTarget {
    Image(ImageHandle),
    ///The currently acquired image of the swapchain.
    Swapchain(SwapchainHandle),
}

impl From<ImageHandle> for AttachmentTarget {
    fn from(h: ImageHandle) -> Self {
        AttachmentTarget::Image(h)
    }
}

impl From<SwapchainHandle> for AttachmentTarget {
    fn from(h: SwapchainHandle) -> Self {
        AttachmentTarget::Swapchain(h)
    }
}

///Render target of a pass.
#[derive(Clone, Debug, PartialEq)]
pub struct Attachment {
    pub target: AttachmentTarget,
    pub mip: u32,
    pub layer: u32,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear: Option<ClearValue>,
}

impl Attachment {
    ///Color target that is cleared to black.
    pub fn color(target: impl Into<AttachmentTarget>) -> Self {
        Attachment {
            target: target.into(),
            mip: 0,
            layer: 0,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            clear: Some(ClearValue::Color([0.0, 0.0, 0.0, 1.0])),
        }
    }

    ///Depth target that is cleared to 1.0.
    pub fn depth(image: ImageHandle) -> Self {
        Attachment {
            target: AttachmentTarget::Image(image),
            mip: 0,
            layer: 0,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            clear: Some(ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            }),
        }
    }

    ///Keeps the current content instead of clearing.
    pub fn load(mut self) -> Self {
        self.load_op = vk::AttachmentLoadOp::LOAD;
        self.clear = None;
        self
    }

    pub fn with_clear(mut self, clear: ClearValue) -> Self {
        self.load_op = vk::AttachmentLoadOp::CLEAR;
        self.clear = Some(clear);
        self
    }

    pub fn with_subresource(mut self, mip: u32, layer: u32) -> Self {
        self.mip = mip;
        self.layer = layer;
        self
    }
}

///Attachment whose target was resolved to a concrete image at record time.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PassAttachment {
    pub(crate) image: ImageKey,
    ///Keeps the target alive while the command exists.
    pub(crate) target: AttachmentTarget,
    pub(crate) mip: u32,
    pub(crate) layer: u32,
    pub(crate) load_op: vk::AttachmentLoadOp,
    pub(crate) store_op: vk::AttachmentStoreOp,
    pub(crate) clear: Option<ClearValue>,
    ///Acquire semaphore if the target is a swapchain image.
    pub(crate) acquire: Option<vk::Semaphore>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PassDesc {
    pub(crate) color: SmallVec<[PassAttachment; 4]>,
    pub(crate) depth: Option<PassAttachment>,
    pub(crate) width: u32,
    pub(crate) height: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Command {
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        regions: SmallVec<[BufferCopyRegion; 1]>,
    },
    CopyBufferToImage {
        src: BufferHandle,
        dst: ImageHandle,
        regions: SmallVec<[BufferImageCopyRegion; 1]>,
    },
    BuildBlas {
        blas: BlasHandle,
        vertices: BufferHandle,
        vertex_stride: u64,
        vertex_count: u32,
        indices: Option<BufferHandle>,
        primitive_count: u32,
    },
    BuildTlas {
        tlas: TlasHandle,
        instances: BufferHandle,
        blas: SmallVec<[BlasHandle; 4]>,
    },
    BeginPass(PassDesc),
    Draw(DrawCall),
    EndPass,
    Dispatch {
        input: ShaderInput,
        groups: [u32; 3],
    },
    TraceRays {
        input: ShaderInput,
        extent: [u32; 3],
    },
    Present {
        swapchain: SwapchainHandle,
        image: ImageKey,
        index: u32,
        acquire: vk::Semaphore,
    },
    ReleaseDependency(DependencyHandle),
    AcquireDependency(DependencyHandle),
    StartTimer(String),
    EndTimer(String),
    ///Submission boundary.
    Pause,
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::CopyBuffer { .. } => "CopyBuffer",
            Command::CopyBufferToImage { .. } => "CopyBufferToImage",
            Command::BuildBlas { .. } => "BuildBlas",
            Command::BuildTlas { .. } => "BuildTlas",
            Command::BeginPass(_) => "BeginPass",
            Command::Draw(_) => "Draw",
            Command::EndPass => "EndPass",
            Command::Dispatch { .. } => "Dispatch",
            Command::TraceRays { .. } => "TraceRays",
            Command::Present { .. } => "Present",
            Command::ReleaseDependency(_) => "ReleaseDependency",
            Command::AcquireDependency(_) => "AcquireDependency",
            Command::StartTimer(_) => "StartTimer",
            Command::EndTimer(_) => "EndTimer",
            Command::Pause => "Pause",
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RecordedCommand {
    ///Submission index, global over all queues of the engine.
    pub(crate) index: u64,
    pub(crate) command: Command,
}

///Append-only command log of one queue for the batch that is currently recorded.
#[derive(Default, Clone)]
pub(crate) struct CommandLog {
    pub(crate) commands: Vec<RecordedCommand>,
    ///Index of the `BeginPass` of a pass that is still open, and its extent.
    pub(crate) open_pass: Option<(usize, u32, u32)>,
    pub(crate) open_timers: Vec<String>,
}

impl CommandLog {
    pub(crate) fn len(&self) -> usize {
        self.commands.len()
    }

    ///Index of the `EndPass` that closes the pass started at `begin`.
    pub(crate) fn pass_end(&self, begin: usize) -> Option<usize> {
        self.commands
            .iter()
            .enumerate()
            .skip(begin + 1)
            .find(|(_, c)| matches!(c.command, Command::EndPass))
            .map(|(i, _)| i)
    }
}
