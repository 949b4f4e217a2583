//! Descriptor set management.
//!
//! A [`DescriptorAggregator`] collects layout-wide binding declarations and
//! per-set resource attachments, then realizes them in one step: one layout
//! per set, a pool sized for every set, and a single batched update.
//!
//! ```ignore
//! let mut descriptors = DescriptorAggregator::new();
//! descriptors.add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)?;
//! descriptors.apply_descriptor_to_new_sets(0, DescriptorResource::whole_buffer(camera_ubo))?;
//! descriptors.new_set()?;
//! unsafe { descriptors.construct(device)? };
//! ```

use crate::error::{GpuError, Result};
use ash::vk;

/// A resource bound to one binding of a set.
#[derive(Debug, Clone, Copy)]
pub enum DescriptorResource {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

impl DescriptorResource {
    /// An entire buffer.
    pub fn whole_buffer(buffer: vk::Buffer) -> Self {
        Self::Buffer(
            vk::DescriptorBufferInfo::default()
                .buffer(buffer)
                .offset(0)
                .range(vk::WHOLE_SIZE),
        )
    }

    /// An image view read through a sampler in a shader.
    pub fn sampled_image(view: vk::ImageView, sampler: vk::Sampler) -> Self {
        Self::Image(
            vk::DescriptorImageInfo::default()
                .image_view(view)
                .sampler(sampler)
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        )
    }

    fn fits(&self, kind: vk::DescriptorType) -> bool {
        let is_buffer = matches!(
            kind,
            vk::DescriptorType::UNIFORM_BUFFER
                | vk::DescriptorType::STORAGE_BUFFER
                | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
        );
        match self {
            Self::Buffer(_) => is_buffer,
            Self::Image(_) => !is_buffer,
        }
    }
}

/// A binding shared by every set of the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingDeclaration {
    pub binding: u32,
    pub kind: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
}

/// A resource attached to a binding of one set.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorAttachment {
    pub binding: u32,
    pub resource: DescriptorResource,
}

/// One entry of the batched descriptor update.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorWrite {
    pub set: usize,
    pub binding: u32,
    pub kind: vk::DescriptorType,
    pub resource: DescriptorResource,
}

/// Everything [`DescriptorAggregator::construct`] creates, computed without
/// touching the device.
#[derive(Debug, Clone)]
pub struct DescriptorPlan {
    /// Bindings in ascending binding order.
    pub bindings: Vec<BindingDeclaration>,
    /// Number of sets to allocate.
    pub set_count: usize,
    /// Pool capacity per descriptor type, totalled over all sets.
    pub pool_sizes: Vec<vk::DescriptorPoolSize>,
    /// Writes grouped by set, each set in binding order.
    pub writes: Vec<DescriptorWrite>,
}

#[derive(Default)]
struct Realized {
    layouts: Vec<vk::DescriptorSetLayout>,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
}

/// Collects descriptor bindings and per-set resources, then creates them once.
#[derive(Default)]
pub struct DescriptorAggregator {
    bindings: Vec<BindingDeclaration>,
    sets: Vec<Vec<DescriptorAttachment>>,
    auto_apply: Vec<DescriptorAttachment>,
    finalized: bool,
    realized: Realized,
}

impl DescriptorAggregator {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.finalized {
            return Err(GpuError::ContractViolation(format!(
                "{operation} after the descriptor sets were constructed"
            )));
        }
        Ok(())
    }

    /// Declare a binding for every set.
    pub fn add_binding(
        &mut self,
        binding: u32,
        kind: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
    ) -> Result<()> {
        self.ensure_open("add_binding")?;
        self.bindings.push(BindingDeclaration {
            binding,
            kind,
            stages,
        });
        Ok(())
    }

    /// Open a new set, pre-filled with the auto-apply resources registered so
    /// far. Returns its index.
    pub fn new_set(&mut self) -> Result<usize> {
        self.ensure_open("new_set")?;
        self.sets.push(self.auto_apply.clone());
        Ok(self.sets.len() - 1)
    }

    /// Attach a resource to the most recently opened set.
    pub fn add_descriptor(&mut self, binding: u32, resource: DescriptorResource) -> Result<()> {
        self.ensure_open("add_descriptor")?;
        let set = self.sets.last_mut().ok_or_else(|| {
            GpuError::ContractViolation("add_descriptor called before new_set".to_string())
        })?;
        set.push(DescriptorAttachment { binding, resource });
        Ok(())
    }

    /// Attach a resource to every set opened from now on.
    pub fn apply_descriptor_to_new_sets(
        &mut self,
        binding: u32,
        resource: DescriptorResource,
    ) -> Result<()> {
        self.ensure_open("apply_descriptor_to_new_sets")?;
        self.auto_apply
            .push(DescriptorAttachment { binding, resource });
        Ok(())
    }

    /// Stop auto-applying resources to new sets.
    pub fn reset_auto_apply_descriptors(&mut self) -> Result<()> {
        self.ensure_open("reset_auto_apply_descriptors")?;
        self.auto_apply.clear();
        Ok(())
    }

    /// Number of opened sets.
    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    /// Sort and validate, then seal the aggregator against further changes.
    ///
    /// Every set must attach exactly one resource per declared binding, of a
    /// kind matching the declaration.
    pub fn finalize(&mut self) -> Result<DescriptorPlan> {
        self.ensure_open("finalize")?;

        self.bindings.sort_by_key(|b| b.binding);
        if let Some(pair) = self
            .bindings
            .windows(2)
            .find(|pair| pair[0].binding == pair[1].binding)
        {
            return Err(GpuError::ContractViolation(format!(
                "binding {} declared twice",
                pair[0].binding
            )));
        }

        for (index, set) in self.sets.iter_mut().enumerate() {
            set.sort_by_key(|a| a.binding);

            let declared: Vec<u32> = self.bindings.iter().map(|b| b.binding).collect();
            let attached: Vec<u32> = set.iter().map(|a| a.binding).collect();
            if declared != attached {
                return Err(GpuError::ContractViolation(format!(
                    "set {index} attaches bindings {attached:?} but the layout declares {declared:?}"
                )));
            }

            if let Some((decl, _)) = self
                .bindings
                .iter()
                .zip(set.iter())
                .find(|(decl, attachment)| !attachment.resource.fits(decl.kind))
            {
                return Err(GpuError::ContractViolation(format!(
                    "set {index} binding {} has the wrong resource kind for {:?}",
                    decl.binding, decl.kind
                )));
            }
        }

        let set_count = self.sets.len();
        let mut pool_sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for decl in &self.bindings {
            match pool_sizes.iter_mut().find(|size| size.ty == decl.kind) {
                Some(size) => size.descriptor_count += set_count as u32,
                None => pool_sizes.push(
                    vk::DescriptorPoolSize::default()
                        .ty(decl.kind)
                        .descriptor_count(set_count as u32),
                ),
            }
        }

        let writes = self
            .sets
            .iter()
            .enumerate()
            .flat_map(|(set, attachments)| {
                self.bindings
                    .iter()
                    .zip(attachments)
                    .map(move |(decl, attachment)| DescriptorWrite {
                        set,
                        binding: decl.binding,
                        kind: decl.kind,
                        resource: attachment.resource,
                    })
            })
            .collect();

        self.finalized = true;

        Ok(DescriptorPlan {
            bindings: self.bindings.clone(),
            set_count,
            pool_sizes,
            writes,
        })
    }

    /// Finalize and create layouts, pool and sets, then write every resource
    /// in one batch. With no sets this only seals the aggregator.
    ///
    /// # Safety
    /// The device must be valid and every attached resource must be alive.
    pub unsafe fn construct(&mut self, device: &ash::Device) -> Result<()> {
        let plan = self.finalize()?;
        if plan.set_count == 0 {
            return Ok(());
        }

        let layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = plan
            .bindings
            .iter()
            .map(|decl| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(decl.binding)
                    .descriptor_type(decl.kind)
                    .descriptor_count(1)
                    .stage_flags(decl.stages)
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&layout_bindings);

        for _ in 0..plan.set_count {
            self.realized
                .layouts
                .push(device.create_descriptor_set_layout(&layout_info, None)?);
        }

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(plan.set_count as u32)
            .pool_sizes(&plan.pool_sizes);
        self.realized.pool = device.create_descriptor_pool(&pool_info, None)?;

        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.realized.pool)
            .set_layouts(&self.realized.layouts);
        self.realized.sets = device.allocate_descriptor_sets(&alloc_info)?;

        let writes: Vec<vk::WriteDescriptorSet> = plan
            .writes
            .iter()
            .map(|write| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(self.realized.sets[write.set])
                    .dst_binding(write.binding)
                    .dst_array_element(0)
                    .descriptor_type(write.kind);
                match &write.resource {
                    DescriptorResource::Buffer(info) => base.buffer_info(std::slice::from_ref(info)),
                    DescriptorResource::Image(info) => base.image_info(std::slice::from_ref(info)),
                }
            })
            .collect();
        device.update_descriptor_sets(&writes, &[]);

        tracing::debug!(
            "Constructed {} descriptor sets with {} writes",
            plan.set_count,
            writes.len()
        );
        Ok(())
    }

    /// One layout per set, in set order.
    pub fn layouts(&self) -> &[vk::DescriptorSetLayout] {
        &self.realized.layouts
    }

    /// The allocated sets.
    pub fn sets(&self) -> &[vk::DescriptorSet] {
        &self.realized.sets
    }

    /// Destroy the pool (freeing its sets) and the layouts, and return the
    /// aggregator to its empty state.
    ///
    /// # Safety
    /// No set may still be in use by the GPU.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        let realized = std::mem::take(&mut self.realized);
        if realized.pool != vk::DescriptorPool::null() {
            device.destroy_descriptor_pool(realized.pool, None);
        }
        for layout in realized.layouts {
            device.destroy_descriptor_set_layout(layout, None);
        }
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn buffer(raw: u64) -> DescriptorResource {
        DescriptorResource::whole_buffer(vk::Buffer::from_raw(raw))
    }

    fn image(raw: u64) -> DescriptorResource {
        DescriptorResource::sampled_image(vk::ImageView::from_raw(raw), vk::Sampler::from_raw(raw))
    }

    fn resource_id(resource: &DescriptorResource) -> u64 {
        match resource {
            DescriptorResource::Buffer(info) => info.buffer.as_raw(),
            DescriptorResource::Image(info) => info.image_view.as_raw(),
        }
    }

    /// Uniform at 0 (auto-applied), sampled image at 2, storage buffer at 1,
    /// declared and attached out of order.
    fn populated() -> DescriptorAggregator {
        let mut agg = DescriptorAggregator::new();
        agg.add_binding(
            2,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::ShaderStageFlags::FRAGMENT,
        )
        .unwrap();
        agg.add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)
            .unwrap();
        agg.add_binding(1, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::VERTEX)
            .unwrap();
        agg.apply_descriptor_to_new_sets(0, buffer(1)).unwrap();

        for i in 0..3 {
            agg.new_set().unwrap();
            agg.add_descriptor(2, image(100 + i)).unwrap();
            agg.add_descriptor(1, buffer(200 + i)).unwrap();
        }
        agg
    }

    #[test]
    fn write_count_is_sum_of_bindings_per_set() {
        let plan = populated().finalize().unwrap();
        assert_eq!(plan.set_count, 3);
        assert_eq!(plan.writes.len(), 3 * 3);
    }

    #[test]
    fn writes_follow_sorted_binding_order() {
        let plan = populated().finalize().unwrap();
        let order: Vec<u32> = plan.bindings.iter().map(|b| b.binding).collect();
        assert_eq!(order, vec![0, 1, 2]);

        for (set, chunk) in plan.writes.chunks(3).enumerate() {
            let bindings: Vec<u32> = chunk.iter().map(|w| w.binding).collect();
            assert_eq!(bindings, order);
            assert!(chunk.iter().all(|w| w.set == set));
            assert_eq!(resource_id(&chunk[0].resource), 1);
            assert_eq!(resource_id(&chunk[1].resource), 200 + set as u64);
            assert_eq!(resource_id(&chunk[2].resource), 100 + set as u64);
            assert_eq!(chunk[2].kind, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        }
    }

    #[test]
    fn pool_sizes_total_over_sets() {
        let mut agg = populated();
        agg.add_binding(3, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::FRAGMENT)
            .unwrap();
        for set in &mut agg.sets {
            set.push(DescriptorAttachment {
                binding: 3,
                resource: buffer(300),
            });
        }
        let plan = agg.finalize().unwrap();

        let count = |ty| {
            plan.pool_sizes
                .iter()
                .find(|size| size.ty == ty)
                .map_or(0, |size| size.descriptor_count)
        };
        assert_eq!(count(vk::DescriptorType::UNIFORM_BUFFER), 6);
        assert_eq!(count(vk::DescriptorType::STORAGE_BUFFER), 3);
        assert_eq!(count(vk::DescriptorType::COMBINED_IMAGE_SAMPLER), 3);
        assert_eq!(plan.pool_sizes.len(), 3);
    }

    #[test]
    fn auto_apply_is_not_retroactive() {
        let mut agg = DescriptorAggregator::new();
        agg.add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)
            .unwrap();
        agg.new_set().unwrap();
        agg.apply_descriptor_to_new_sets(0, buffer(5)).unwrap();
        agg.new_set().unwrap();

        assert!(agg.sets[0].is_empty());
        assert_eq!(agg.sets[1].len(), 1);

        agg.reset_auto_apply_descriptors().unwrap();
        agg.new_set().unwrap();
        assert!(agg.sets[2].is_empty());
    }

    #[test]
    fn finalization_is_one_shot() {
        let mut agg = populated();
        agg.finalize().unwrap();
        assert!(matches!(agg.finalize(), Err(GpuError::ContractViolation(_))));
        assert!(agg.new_set().is_err());
        assert!(agg.add_descriptor(0, buffer(9)).is_err());
        assert!(agg
            .add_binding(7, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::ALL)
            .is_err());
    }

    #[test]
    fn descriptor_without_set_is_rejected() {
        let mut agg = DescriptorAggregator::new();
        assert!(matches!(
            agg.add_descriptor(0, buffer(1)),
            Err(GpuError::ContractViolation(_))
        ));
    }

    #[test]
    fn mismatched_attachments_are_rejected() {
        let mut agg = DescriptorAggregator::new();
        agg.add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)
            .unwrap();
        agg.new_set().unwrap();
        assert!(agg.finalize().is_err());

        let mut agg = DescriptorAggregator::new();
        agg.add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)
            .unwrap();
        agg.new_set().unwrap();
        agg.add_descriptor(0, image(1)).unwrap();
        assert!(agg.finalize().is_err());
    }

    #[test]
    fn empty_aggregator_finalizes_to_nothing() {
        let plan = DescriptorAggregator::new().finalize().unwrap();
        assert_eq!(plan.set_count, 0);
        assert!(plan.writes.is_empty());
        assert!(plan.pool_sizes.is_empty());
    }
}
