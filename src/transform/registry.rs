//! Per-method transform cache
//!
//! The registry hands out at most one live [`MethodTransform`] per method. Its lock guards only the
//! map: ballooning, CFG construction and syncing all happen outside of it, and each transform sits
//! behind its own (uncontended, since edits to one method are serialized by the caller) mutex.
//!
//! Handles borrow the registry, so [`TransformRegistry::sync_all`] (which takes `&mut self`) cannot
//! be called while any handle to any transform is still around.

use super::MethodTransform;
use crate::dex::{DexMethod, Error, MethodId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type SharedTransform = Arc<Mutex<MethodTransform>>;

#[derive(Default)]
pub struct TransformRegistry {
    cache: Mutex<HashMap<MethodId, SharedTransform>>,
}

/// Handle to a cached transform
pub struct TransformRef<'r> {
    transform: SharedTransform,
    registry: PhantomData<&'r TransformRegistry>,
}

impl<'r> TransformRef<'r> {
    fn new(transform: SharedTransform) -> TransformRef<'r> {
        TransformRef {
            transform,
            registry: PhantomData,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, MethodTransform> {
        self.transform.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Do both handles refer to the same transform instance?
    pub fn ptr_eq(&self, other: &TransformRef<'_>) -> bool {
        Arc::ptr_eq(&self.transform, &other.transform)
    }
}

impl<'r> fmt::Debug for TransformRef<'r> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransformRef({:?})", self.lock().method())
    }
}

impl TransformRegistry {
    pub fn new() -> TransformRegistry {
        TransformRegistry::default()
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<MethodId, SharedTransform>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.cache().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache().is_empty()
    }

    pub fn contains(&self, method: MethodId) -> bool {
        self.cache().contains_key(&method)
    }

    /// Get the transform of a method, ballooning it on first request
    ///
    /// With `want_cfg`, the returned transform has a control-flow graph (built now if the cached
    /// transform did not have one).
    pub fn load_method_transform(
        &self,
        method: &Arc<DexMethod>,
        want_cfg: bool,
    ) -> Result<TransformRef<'_>, Error> {
        let cached = self.cache().get(&method.id()).cloned();
        let shared = match cached {
            Some(shared) => shared,
            None => {
                let mut transform = MethodTransform::from_method(method.clone())?;
                if want_cfg {
                    transform.build_cfg();
                }
                let fresh = Arc::new(Mutex::new(transform));

                // Another thread may have registered the method in the meantime: keep theirs
                let shared = self
                    .cache()
                    .entry(method.id())
                    .or_insert_with(|| fresh.clone())
                    .clone();
                if Arc::ptr_eq(&shared, &fresh) {
                    log::trace!("Ballooned {:?}", method);
                }
                shared
            }
        };

        let transform = TransformRef::new(shared);
        if want_cfg {
            let mut locked = transform.lock();
            if locked.cfg().is_none() {
                locked.build_cfg();
            }
        }
        Ok(transform)
    }

    /// Like [`TransformRegistry::load_method_transform`], but malformed code is fatal
    pub fn get_method_transform(&self, method: &Arc<DexMethod>, want_cfg: bool) -> TransformRef<'_> {
        match self.load_method_transform(method, want_cfg) {
            Ok(transform) => transform,
            Err(err) => panic!("cannot balloon {:?}: {:?}", method, err),
        }
    }

    /// Register an empty transform for a method that has no code yet
    pub fn get_new_method(&self, method: &Arc<DexMethod>) -> TransformRef<'_> {
        let fresh = Arc::new(Mutex::new(MethodTransform::empty(method.clone())));
        let mut cache = self.cache();
        assert!(
            !cache.contains_key(&method.id()),
            "{:?} already has a transform",
            method
        );
        cache.insert(method.id(), fresh.clone());
        TransformRef::new(fresh)
    }

    /// Sync every cached transform and empty the cache
    pub fn sync_all(&mut self) {
        let cache = self.cache.get_mut().unwrap_or_else(PoisonError::into_inner);
        let mut transforms: Vec<(MethodId, SharedTransform)> = cache.drain().collect();
        transforms.sort_by_key(|(id, _)| *id);
        for (_, transform) in &transforms {
            transform
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .sync();
        }
        log::info!("Synced {} method transform(s)", transforms.len());
    }
}

/// Scoped access to a transform that syncs it when dropped
pub struct MethodTransformer<'r> {
    transform: TransformRef<'r>,
}

impl<'r> MethodTransformer<'r> {
    pub fn new(
        registry: &'r TransformRegistry,
        method: &Arc<DexMethod>,
        want_cfg: bool,
    ) -> MethodTransformer<'r> {
        MethodTransformer {
            transform: registry.get_method_transform(method, want_cfg),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, MethodTransform> {
        self.transform.lock()
    }

    pub fn transform(&self) -> &TransformRef<'r> {
        &self.transform
    }
}

impl<'r> Drop for MethodTransformer<'r> {
    fn drop(&mut self) {
        // Syncing a half-edited method while unwinding would only bury the original panic
        if std::thread::panicking() {
            return;
        }
        self.transform.lock().sync();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dex::{DexCode, DexInstruction, DexOpcode};

    fn method(id: u32) -> Arc<DexMethod> {
        // const/4 v0, 0 / return v0
        DexMethod::new(
            MethodId(id),
            format!("m{}", id),
            Some(DexCode::new(1, 0, vec![0x0012, 0x000f])),
        )
    }

    #[test]
    fn same_method_same_transform() {
        let mut registry = TransformRegistry::new();
        let m = method(1);
        {
            let first = registry.get_method_transform(&m, false);
            let second = registry.get_method_transform(&m, false);
            assert!(first.ptr_eq(&second));
            assert!(first.lock().cfg().is_none());

            let with_cfg = registry.get_method_transform(&m, true);
            assert!(with_cfg.ptr_eq(&first));
            assert!(first.lock().cfg().is_some());
        }
        assert!(registry.contains(m.id()));
        registry.sync_all();
        assert!(!registry.contains(m.id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_requests_share_one_instance() {
        let registry = TransformRegistry::new();
        let methods: Vec<Arc<DexMethod>> = (0..4).map(method).collect();
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let registry = &registry;
                    let m = methods[i % 4].clone();
                    scope.spawn(move || {
                        let transform = registry.get_method_transform(&m, i % 2 == 0);
                        Arc::as_ptr(&transform.transform) as usize
                    })
                })
                .collect();
            let ptrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            for i in 0..4 {
                assert_eq!(ptrs[i], ptrs[i + 4]);
            }
        });
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn transformer_syncs_on_drop() {
        let registry = TransformRegistry::new();
        let m = method(1);
        {
            let mt = MethodTransformer::new(&registry, &m, false);
            let mut transform = mt.lock();
            let first = transform.fat_method().first().unwrap();
            transform.replace_opcode(
                first,
                DexInstruction::new(DexOpcode::Const4)
                    .with_dest(0)
                    .with_literal(7),
            );
            assert_eq!(m.code().unwrap().insns, vec![0x0012, 0x000f]);
        }
        assert_eq!(m.code().unwrap().insns, vec![0x7012, 0x000f]);
    }

    #[test]
    fn new_methods_start_empty() {
        let mut registry = TransformRegistry::new();
        let m = DexMethod::new(MethodId(9), "synthetic", None);
        {
            let transform = registry.get_new_method(&m);
            let mut locked = transform.lock();
            locked.set_frame(0, 0);
            locked.push_back(DexInstruction::new(DexOpcode::ReturnVoid));
        }
        registry.sync_all();
        assert_eq!(m.code().unwrap().insns, vec![0x000e]);
    }
}
