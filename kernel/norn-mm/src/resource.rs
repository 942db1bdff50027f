//! Physical resource map.
//!
//! A sorted tree of physical address regions (System RAM, the kernel
//! image, ACPI tables, PCI windows, firmware reservations). Children are
//! strictly contained in their parent and siblings never overlap; each
//! child list is kept sorted by start address.
//!
//! Stored as an arena of nodes addressed by index, so the tree needs no
//! heap and no reference counting.

use norn_core::addr::PhysAddr;
use planck_noalloc::vec::ArrayVec;

use crate::MemError;

/// Maximum number of resources the map can hold.
pub const MAX_RESOURCES: usize = 128;

/// Maximum direct children per resource.
const MAX_CHILDREN: usize = 64;

/// What a physical region is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// General-purpose RAM.
    SystemRam,
    /// The loaded kernel image.
    NornImage,
    /// ACPI tables.
    AcpiTables,
    /// PCI MMIO / ECAM windows.
    Pci,
    /// Firmware or hardware reservations.
    Reserved,
    /// Anything the firmware did not identify.
    Unknown,
}

impl ResourceKind {
    /// Display name used when dumping the map.
    pub const fn name(self) -> &'static str {
        match self {
            Self::SystemRam => "System RAM",
            Self::NornImage => "Norn Image",
            Self::AcpiTables => "ACPI Tables",
            Self::Pci => "PCI",
            Self::Reserved => "Reserved",
            Self::Unknown => "Unknown",
        }
    }
}

/// Handle to a resource in the arena.
pub type ResourceId = u16;

/// One physical region.
#[derive(Debug)]
pub struct Resource {
    /// Physical start address.
    pub start: PhysAddr,
    /// Size in bytes.
    pub size: u64,
    /// What the region is used for.
    pub kind: ResourceKind,
    /// Parent node; the root's parent is itself.
    pub parent: ResourceId,
    /// Children sorted by ascending start address.
    children: ArrayVec<ResourceId, MAX_CHILDREN>,
}

impl Resource {
    /// Exclusive end address.
    pub fn end(&self) -> u64 {
        self.start.as_u64() + self.size
    }

    /// Whether `[start, start + size)` lies strictly inside this resource.
    fn contains(&self, start: u64, size: u64) -> bool {
        self.start.as_u64() <= start && start + size <= self.end()
    }

    /// Whether this resource overlaps `[start, start + size)` at all.
    fn overlaps(&self, start: u64, size: u64) -> bool {
        self.start.as_u64() < start + size && start < self.end()
    }

    /// Children sorted by start address.
    pub fn children(&self) -> &[ResourceId] {
        self.children.as_slice()
    }
}

/// The resource tree.
pub struct ResourceMap {
    nodes: ArrayVec<Resource, MAX_RESOURCES>,
}

/// Root resource id: the whole physical address space.
pub const ROOT: ResourceId = 0;

impl ResourceMap {
    /// Creates a map with a root node spanning the full physical space.
    pub fn new() -> Self {
        let mut nodes = ArrayVec::new();
        nodes.push(Resource {
            start: PhysAddr::zero(),
            size: u64::MAX,
            kind: ResourceKind::Unknown,
            parent: ROOT,
            children: ArrayVec::new(),
        });
        Self { nodes }
    }

    /// Returns the resource with the given id.
    pub fn get(&self, id: ResourceId) -> &Resource {
        &self.nodes[id as usize]
    }

    /// Number of nodes, including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the map holds only the root.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Inserts a region, attaching it under the deepest resource that
    /// fully contains it.
    ///
    /// Fails with `InvalidRegion` if the region partially overlaps an
    /// existing sibling (strict containment is required) and with
    /// `OutOfMemory` if the arena is full.
    pub fn insert(
        &mut self,
        start: PhysAddr,
        size: u64,
        kind: ResourceKind,
    ) -> Result<ResourceId, MemError> {
        if size == 0 {
            return Err(MemError::InvalidRegion);
        }
        if self.nodes.len() == MAX_RESOURCES {
            return Err(MemError::OutOfMemory);
        }
        let s = start.as_u64();

        // Descend to the deepest node containing the new region.
        let mut parent = ROOT;
        loop {
            let mut descended = false;
            for &child in self.nodes[parent as usize].children.iter() {
                let node = &self.nodes[child as usize];
                if node.contains(s, size) {
                    parent = child;
                    descended = true;
                    break;
                }
                let engulfed = s <= node.start.as_u64() && node.end() <= s + size;
                if node.overlaps(s, size) && !engulfed {
                    // Partial overlap with an existing node; engulfed
                    // children are adopted below instead.
                    return Err(MemError::InvalidRegion);
                }
            }
            if !descended {
                break;
            }
        }

        let id = self.nodes.len() as ResourceId;
        self.nodes.push(Resource {
            start,
            size,
            kind,
            parent,
            children: ArrayVec::new(),
        });

        // Re-parent any existing children now strictly contained in the
        // new node, then insert it into the parent's sorted child list.
        let mut kept: ArrayVec<ResourceId, MAX_CHILDREN> = ArrayVec::new();
        let mut adopted: ArrayVec<ResourceId, MAX_CHILDREN> = ArrayVec::new();
        for i in 0..self.nodes[parent as usize].children.len() {
            let child = self.nodes[parent as usize].children[i];
            let node = &self.nodes[child as usize];
            if s <= node.start.as_u64() && node.end() <= s + size {
                adopted.push(child);
            } else {
                kept.push(child);
            }
        }
        let mut pos = kept.len();
        for (i, &child) in kept.iter().enumerate() {
            if self.nodes[child as usize].start > start {
                pos = i;
                break;
            }
        }
        kept.insert(pos, id);
        self.nodes[parent as usize].children = kept;
        for &child in adopted.iter() {
            self.nodes[child as usize].parent = id;
            self.nodes[id as usize].children.push(child);
        }

        Ok(id)
    }

    /// Visits every node except the root in depth-first order, passing the
    /// nesting depth (1 = top level).
    pub fn walk(&self, mut f: impl FnMut(usize, &Resource)) {
        fn rec(map: &ResourceMap, id: ResourceId, depth: usize, f: &mut impl FnMut(usize, &Resource)) {
            for &child in map.nodes[id as usize].children.iter() {
                f(depth, &map.nodes[child as usize]);
                rec(map, child, depth + 1, f);
            }
        }
        rec(self, ROOT, 1, &mut f);
    }
}

impl Default for ResourceMap {
    fn default() -> Self {
        Self::new()
    }
}
