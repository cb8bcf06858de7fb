//! In-process stand-ins for the runtime and the durable store.
//!
//! Used by the integration tests of this crate and the front end, and by
//! embedders that want to exercise the cache protocol without a live VM.

use std::collections::HashMap;

use parking_lot::Mutex;

use aotc_canon::ClassImage;
use aotc_error::Result;
use aotc_types::{CompatibilityDescriptor, CompatibilityHeader};

use crate::resolver::DurableStore;
use crate::runtime::{ClassHandle, ClassRuntime, LoaderHandle, LocalHandle, MethodHandle, ThunkHandle};

#[derive(Debug)]
struct SimLoader {
    first_class: Option<String>,
    classes: HashMap<String, ClassHandle>,
    live: bool,
}

#[derive(Debug)]
struct SimClass {
    loader: LoaderHandle,
    name: String,
    image: ClassImage,
    supers: Vec<ClassHandle>,
    live: bool,
}

#[derive(Debug)]
struct SimState {
    next_handle: u64,
    header: CompatibilityHeader,
    loaders: HashMap<LoaderHandle, SimLoader>,
    classes: HashMap<ClassHandle, SimClass>,
    methods: HashMap<(ClassHandle, u32), MethodHandle>,
    method_owner: HashMap<MethodHandle, ClassHandle>,
    invalid_methods: Vec<MethodHandle>,
    thunks: HashMap<String, ThunkHandle>,
}

impl SimState {
    fn allocate(&mut self) -> u64 {
        self.next_handle += 0x10;
        self.next_handle
    }

    fn class_live(&self, class: ClassHandle) -> bool {
        self.classes.get(&class).is_some_and(|c| c.live)
    }
}

/// A runtime whose loaders and classes are defined by hand.
#[derive(Debug)]
pub struct SimulatedRuntime {
    state: Mutex<SimState>,
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self::with_header(CompatibilityDescriptor::default().encode())
    }

    pub fn with_header(header: CompatibilityHeader) -> Self {
        Self {
            state: Mutex::new(SimState {
                next_handle: 0x1000,
                header,
                loaders: HashMap::new(),
                classes: HashMap::new(),
                methods: HashMap::new(),
                method_owner: HashMap::new(),
                invalid_methods: Vec::new(),
                thunks: HashMap::new(),
            }),
        }
    }

    pub fn define_loader(&self) -> LoaderHandle {
        let mut state = self.state.lock();
        let handle = LoaderHandle(state.allocate());
        state.loaders.insert(
            handle,
            SimLoader {
                first_class: None,
                classes: HashMap::new(),
                live: true,
            },
        );
        handle
    }

    /// Load `image` in `loader`. `supers` is the rest of its class chain.
    /// A class of the same name in the same loader is replaced.
    pub fn define_class(
        &self,
        loader: LoaderHandle,
        image: ClassImage,
        supers: &[ClassHandle],
    ) -> Result<ClassHandle> {
        let name = image.name()?.to_owned();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let handle = ClassHandle(state.allocate());
        if let Some(l) = state.loaders.get_mut(&loader) {
            l.first_class.get_or_insert_with(|| name.clone());
            if let Some(previous) = l.classes.insert(name.clone(), handle) {
                if let Some(old) = state.classes.get_mut(&previous) {
                    old.live = false;
                }
            }
        }
        state.classes.insert(
            handle,
            SimClass {
                loader,
                name,
                image,
                supers: supers.to_vec(),
                live: true,
            },
        );
        Ok(handle)
    }

    /// Replace a live class with a new version. The old handle dies.
    pub fn redefine_class(&self, old: ClassHandle, image: ClassImage) -> Option<ClassHandle> {
        let (loader, supers) = {
            let state = self.state.lock();
            let class = state.classes.get(&old).filter(|c| c.live)?;
            (class.loader, class.supers.clone())
        };
        self.define_class(loader, image, &supers).ok()
    }

    pub fn unload_class(&self, class: ClassHandle) {
        let mut state = self.state.lock();
        let Some(c) = state.classes.get_mut(&class) else {
            return;
        };
        c.live = false;
        let (loader, name) = (c.loader, c.name.clone());
        if let Some(l) = state.loaders.get_mut(&loader) {
            if l.classes.get(&name) == Some(&class) {
                l.classes.remove(&name);
            }
        }
    }

    /// Unload `loader` and every class it defined.
    pub fn unload_loader(&self, loader: LoaderHandle) {
        let mut state = self.state.lock();
        let Some(l) = state.loaders.get_mut(&loader) else {
            return;
        };
        l.live = false;
        let classes: Vec<ClassHandle> = l.classes.drain().map(|(_, c)| c).collect();
        for class in classes {
            if let Some(c) = state.classes.get_mut(&class) {
                c.live = false;
            }
        }
    }

    pub fn invalidate_method(&self, method: MethodHandle) {
        self.state.lock().invalid_methods.push(method);
    }

    pub fn set_compatibility_header(&self, header: CompatibilityHeader) {
        self.state.lock().header = header;
    }
}

impl ClassRuntime for SimulatedRuntime {
    fn find_loader(&self, first_class_name: &str) -> Option<LoaderHandle> {
        let state = self.state.lock();
        state
            .loaders
            .iter()
            .filter(|(_, l)| l.live && l.first_class.as_deref() == Some(first_class_name))
            .map(|(h, _)| *h)
            .min()
    }

    fn find_class(&self, loader: LoaderHandle, name: &str) -> Option<ClassHandle> {
        let state = self.state.lock();
        state
            .loaders
            .get(&loader)
            .filter(|l| l.live)
            .and_then(|l| l.classes.get(name).copied())
    }

    fn class_image(&self, class: ClassHandle) -> Option<ClassImage> {
        let state = self.state.lock();
        state
            .classes
            .get(&class)
            .filter(|c| c.live)
            .map(|c| c.image.clone())
    }

    fn class_chain(&self, class: ClassHandle) -> Option<Vec<ClassHandle>> {
        let state = self.state.lock();
        let c = state.classes.get(&class).filter(|c| c.live)?;
        let mut chain = Vec::with_capacity(c.supers.len() + 1);
        chain.push(class);
        chain.extend_from_slice(&c.supers);
        Some(chain)
    }

    fn method(&self, class: ClassHandle, index: u32) -> Option<MethodHandle> {
        let mut state = self.state.lock();
        let count = state
            .classes
            .get(&class)
            .filter(|c| c.live)?
            .image
            .method_count();
        if index as usize >= count {
            return None;
        }
        if let Some(existing) = state.methods.get(&(class, index)) {
            return Some(*existing);
        }
        let handle = MethodHandle(state.allocate());
        state.methods.insert((class, index), handle);
        state.method_owner.insert(handle, class);
        Some(handle)
    }

    fn compatibility_header(&self) -> CompatibilityHeader {
        self.state.lock().header
    }

    fn install_thunk(&self, signature: &str, code: &[u8]) -> Option<ThunkHandle> {
        if code.is_empty() {
            return None;
        }
        let mut state = self.state.lock();
        if let Some(existing) = state.thunks.get(signature) {
            return Some(*existing);
        }
        let handle = ThunkHandle(state.allocate());
        state.thunks.insert(signature.to_owned(), handle);
        Some(handle)
    }

    fn is_live(&self, handle: LocalHandle) -> bool {
        let state = self.state.lock();
        match handle {
            LocalHandle::Loader(l) => state.loaders.get(&l).is_some_and(|l| l.live),
            LocalHandle::Class(c) => state.class_live(c),
            LocalHandle::ClassChain(c) => state.classes.get(&c).is_some_and(|class| {
                class.live && class.supers.iter().all(|s| state.class_live(*s))
            }),
            LocalHandle::Method(m) => {
                !state.invalid_methods.contains(&m)
                    && state
                        .method_owner
                        .get(&m)
                        .is_some_and(|c| state.class_live(*c))
            }
            LocalHandle::Thunk(t) => state.thunks.values().any(|h| *h == t),
            LocalHandle::WellKnownClasses | LocalHandle::AotHeader => true,
        }
    }
}

/// A bounded table of durable-store entries, addressed by 8-byte slots.
#[derive(Debug)]
pub struct InMemoryDurableStore {
    capacity: usize,
    offsets: Mutex<HashMap<LocalHandle, u64>>,
}

impl InMemoryDurableStore {
    const SLOT: u64 = 8;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            offsets: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.offsets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableStore for InMemoryDurableStore {
    fn offset_of(&self, handle: LocalHandle) -> Option<u64> {
        let mut offsets = self.offsets.lock();
        if let Some(offset) = offsets.get(&handle) {
            return Some(*offset);
        }
        if offsets.len() >= self.capacity {
            return None;
        }
        let offset = offsets.len() as u64 * Self::SLOT;
        offsets.insert(handle, offset);
        Some(offset)
    }
}
