//! C2: the component registry. An insertion-ordered collection of
//! components, keyed by their decorated name with markers stripped.
//! Iteration order is declaration order — this is load-bearing, since
//! address-window and `spd_id` assignment both depend on it.

use std::collections::HashMap;

use crate::cobj::Cobj;
use crate::consts::{BOOT_COMP, BOOT_COMP2, CONFIG_COMP, INIT_COMP, MPD_MGR, NUM_ATOMIC_SYMBS};
use crate::object::{ExportedSymbol, UndefinedSymbol};

/// Stable handle into the registry. Never reused, never reordered.
pub type ComponentId = usize;

/// One declared edge `caller -> dependencies[i].target`.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub target: ComponentId,
    pub modifier: Option<String>,
    pub resolved: bool,
}

/// Pre-link size and file offset of one of a component's three placed
/// regions (RO, DATA, BSS), filled in by the layout stage (C6).
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionPlacement {
    pub file_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sections {
    pub ro: SectionPlacement,
    pub data: SectionPlacement,
    pub bss: SectionPlacement,
}

#[derive(Debug, Clone)]
pub struct Component {
    pub name: String,
    pub obj_path: std::path::PathBuf,
    /// Path before stub synthesis replaced it with a combined object; kept
    /// only so error messages can name the file the user actually wrote.
    pub original_obj_path: std::path::PathBuf,
    pub init_str: String,

    pub is_scheduler: bool,
    pub is_boot_packaged: bool,
    pub is_root_scheduler: bool,
    pub scheduler: Option<ComponentId>,

    pub exported: Vec<ExportedSymbol>,
    pub undefined: Vec<UndefinedSymbol>,
    pub dependencies: Vec<Dependency>,

    pub sections: Sections,
    pub lower_addr: u64,
    pub size: u64,
    pub heap_top: u64,
    pub depth: i32,

    /// Bound addresses of the component's own `ATOMIC_USER_DEF` symbols,
    /// resolved the same way exported addresses are (C6 pass 2); entries a
    /// component doesn't define are left zero. Patched into its
    /// `cos_comp_info` at install time (C9).
    pub atomic_region_addrs: [u64; NUM_ATOMIC_SYMBS],

    /// 1-based, monotonic, assigned at install time (C8/C9); `None` before.
    pub spd_id: Option<u32>,
    pub cobj: Option<Cobj>,
}

impl Component {
    pub fn new(name: String, obj_path: std::path::PathBuf, init_str: String) -> Self {
        Component {
            name,
            obj_path: obj_path.clone(),
            original_obj_path: obj_path,
            init_str,
            is_scheduler: false,
            is_boot_packaged: false,
            is_root_scheduler: false,
            scheduler: None,
            exported: Vec::new(),
            undefined: Vec::new(),
            dependencies: Vec::new(),
            sections: Sections::default(),
            lower_addr: 0,
            size: 0,
            heap_top: 0,
            depth: -1,
            atomic_region_addrs: [0; NUM_ATOMIC_SYMBS],
            spd_id: None,
            cobj: None,
        }
    }

    pub fn find_export(&self, name: &str) -> Option<usize> {
        self.exported.iter().position(|s| s.name == name)
    }
}

/// The fixed set of components the pipeline recognizes by path substring,
/// rather than scattering `str::contains` calls through the rest of the
/// loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialComponent {
    Initial,
    MpdManager,
    InitFile,
    Config,
    Boot,
}

impl SpecialComponent {
    fn matches(self, name: &str) -> bool {
        match self {
            SpecialComponent::Initial => name.contains(INIT_COMP),
            SpecialComponent::MpdManager => name.contains(MPD_MGR),
            SpecialComponent::InitFile => name.contains(crate::consts::INIT_FILE),
            SpecialComponent::Config => name.contains(CONFIG_COMP),
            SpecialComponent::Boot => name.contains(BOOT_COMP) || name.contains(BOOT_COMP2),
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    components: Vec<Component>,
    by_name: HashMap<String, ComponentId>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn insert(&mut self, component: Component) -> ComponentId {
        let id = self.components.len();
        self.by_name.insert(component.name.clone(), id);
        self.components.push(component);
        id
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn get_id(&self, name: &str) -> Option<ComponentId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: ComponentId) -> &Component {
        &self.components[id]
    }

    pub fn get_mut(&mut self, id: ComponentId) -> &mut Component {
        &mut self.components[id]
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Iterates components in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (ComponentId, &Component)> {
        self.components.iter().enumerate()
    }

    pub fn ids(&self) -> impl Iterator<Item = ComponentId> {
        0..self.components.len()
    }

    pub fn find_special(&self, kind: SpecialComponent) -> Option<ComponentId> {
        self.components
            .iter()
            .position(|c| kind.matches(&c.name))
    }
}
