use std::fmt::Debug;
use std::sync::{Arc, OnceLock};

/// A lazily computed value, evaluated at most once and then memoized.
///
/// Used to wire values that are only known when the graph is executed, e.g.
/// a list of input roots computed by a closure. Clones share the same cell,
/// so the thunk runs once no matter how many tasks hold the value.
pub struct Deferred<T> {
    cell: Arc<OnceLock<T>>,
    init: Arc<dyn Fn() -> T + Send + Sync>,
}

impl<T> Deferred<T>
where
    T: Send + Sync + 'static,
{
    pub fn new<F>(init: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            cell: Arc::new(OnceLock::new()),
            init: Arc::new(init),
        }
    }

    /// An already evaluated value.
    pub fn ready(value: T) -> Self
    where
        T: Clone,
    {
        let cell = OnceLock::new();
        let _ = cell.set(value.clone());

        Self {
            cell: Arc::new(cell),
            init: Arc::new(move || value.clone()),
        }
    }

    pub fn get(&self) -> &T {
        self.cell.get_or_init(|| (self.init)())
    }

    pub fn is_evaluated(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            init: self.init.clone(),
        }
    }
}

impl<T: Debug> Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.cell.get() {
            Some(value) => f.debug_tuple("Deferred").field(value).finish(),
            None => f.write_str("Deferred(<pending>)"),
        }
    }
}
