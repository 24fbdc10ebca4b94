//! Tenant-scoped id pooling
//!
//! A tenant (usually a load balancer target) owns at most one pooled id at a
//! time. Any number of borrowers share that id; when the last borrower lets
//! go, the tenant is unmapped and the id goes back on the free list for the
//! next tenant. Borrowers can be grouped under an outer scope (an inbound
//! connection, say) and released all at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Low-level id source used when the free list is empty
pub type Allocator<T, I> = dyn FnMut(&T) -> I + Send;

/// Id held by one tenant and the borrowers sharing it
struct Lease<I> {
    id: I,
    borrowers: HashSet<String>,
}

/// What a borrower holds
struct Borrower<T> {
    tenants: HashSet<T>,
    scope: Option<String>,
}

/// Internal pool state
struct PoolState<T, I> {
    leases: HashMap<T, Lease<I>>,
    borrowers: HashMap<String, Borrower<T>>,
    scopes: HashMap<String, HashSet<String>>,
    free_ids: VecDeque<I>,
    created: usize,
    allocator: Box<Allocator<T, I>>,
}

impl<T: Hash + Eq + Clone, I: Clone> PoolState<T, I> {
    fn register(&mut self, scope: Option<&str>, tenant: &T, borrower: &str) -> I {
        let id = match self.leases.get_mut(tenant) {
            Some(lease) => {
                lease.borrowers.insert(borrower.to_string());
                lease.id.clone()
            }
            None => {
                let id = match self.free_ids.pop_front() {
                    Some(id) => {
                        tracing::debug!("Recycled pooled id for new tenant");
                        id
                    }
                    None => {
                        self.created += 1;
                        tracing::debug!("Allocated pooled id #{}", self.created);
                        (self.allocator)(tenant)
                    }
                };
                self.leases.insert(
                    tenant.clone(),
                    Lease {
                        id: id.clone(),
                        borrowers: HashSet::from([borrower.to_string()]),
                    },
                );
                id
            }
        };

        let entry = self
            .borrowers
            .entry(borrower.to_string())
            .or_insert_with(|| Borrower {
                tenants: HashSet::new(),
                scope: None,
            });
        entry.tenants.insert(tenant.clone());

        if let Some(scope) = scope {
            if entry.scope.is_none() {
                entry.scope = Some(scope.to_string());
                self.scopes
                    .entry(scope.to_string())
                    .or_default()
                    .insert(borrower.to_string());
            }
        }

        id
    }

    /// Drop `borrower` from the lease of `tenant`, recycling the id if it was
    /// the last one
    fn release_lease(&mut self, tenant: &T, borrower: &str) -> bool {
        let Some(lease) = self.leases.get_mut(tenant) else {
            return false;
        };
        if !lease.borrowers.remove(borrower) {
            return false;
        }

        if lease.borrowers.is_empty() {
            if let Some(lease) = self.leases.remove(tenant) {
                tracing::debug!("Pooled id returned to free list");
                self.free_ids.push_back(lease.id);
            }
        }
        true
    }

    fn forget_borrower(&mut self, borrower: &str) {
        let Some(entry) = self.borrowers.remove(borrower) else {
            return;
        };
        if let Some(scope) = entry.scope {
            if let Some(members) = self.scopes.get_mut(&scope) {
                members.remove(borrower);
                if members.is_empty() {
                    self.scopes.remove(&scope);
                }
            }
        }
    }

    fn free(&mut self, borrower: &str) -> bool {
        let Some(entry) = self.borrowers.get(borrower) else {
            return false;
        };

        let tenants: Vec<T> = entry.tenants.iter().cloned().collect();
        for tenant in &tenants {
            self.release_lease(tenant, borrower);
        }
        self.forget_borrower(borrower);
        true
    }

    fn free_pair(&mut self, tenant: &T, borrower: &str) -> bool {
        if !self.release_lease(tenant, borrower) {
            return false;
        }

        let drained = match self.borrowers.get_mut(borrower) {
            Some(entry) => {
                entry.tenants.remove(tenant);
                entry.tenants.is_empty()
            }
            None => false,
        };
        if drained {
            self.forget_borrower(borrower);
        }
        true
    }
}

/// Pool handing out recyclable ids per tenant
///
/// Cloning yields another handle to the same pool.
pub struct ResourcePool<T, I> {
    state: Arc<parking_lot::Mutex<PoolState<T, I>>>,
}

impl<T: Hash + Eq + Clone, I: Clone> ResourcePool<T, I> {
    /// Create a pool drawing new ids from `allocator`
    ///
    /// The allocator runs under the pool lock and must not call back into
    /// the pool.
    pub fn new<F>(allocator: F) -> Self
    where
        F: FnMut(&T) -> I + Send + 'static,
    {
        Self {
            state: Arc::new(parking_lot::Mutex::new(PoolState {
                leases: HashMap::new(),
                borrowers: HashMap::new(),
                scopes: HashMap::new(),
                free_ids: VecDeque::new(),
                created: 0,
                allocator: Box::new(allocator),
            })),
        }
    }

    /// Get the id of `tenant`, registering `borrower` on it
    pub fn allocate(&self, tenant: &T, borrower: &str) -> I {
        self.state.lock().register(None, tenant, borrower)
    }

    /// Like [`allocate`](Self::allocate), also recording `borrower` under
    /// `scope` for [`free_scope`](Self::free_scope)
    ///
    /// A borrower belongs to the first scope it was registered with.
    pub fn allocate_scoped(&self, scope: &str, tenant: &T, borrower: &str) -> I {
        self.state.lock().register(Some(scope), tenant, borrower)
    }

    /// Release everything `borrower` holds
    ///
    /// Returns false for an unknown borrower.
    pub fn free(&self, borrower: &str) -> bool {
        self.state.lock().free(borrower)
    }

    /// Release `borrower` from one tenant only
    pub fn free_pair(&self, tenant: &T, borrower: &str) -> bool {
        self.state.lock().free_pair(tenant, borrower)
    }

    /// Release every borrower registered under `scope`, returning how many
    pub fn free_scope(&self, scope: &str) -> usize {
        let mut state = self.state.lock();
        let Some(members) = state.scopes.remove(scope) else {
            return 0;
        };

        let mut released = 0;
        for borrower in members {
            if state.free(&borrower) {
                released += 1;
            }
        }
        tracing::debug!("Freed {} borrowers of scope {}", released, scope);
        released
    }

    /// Id currently held by `tenant`
    pub fn id_of(&self, tenant: &T) -> Option<I> {
        self.state.lock().leases.get(tenant).map(|lease| lease.id.clone())
    }

    /// Number of borrowers sharing the id of `tenant`
    pub fn borrower_count(&self, tenant: &T) -> usize {
        self.state
            .lock()
            .leases
            .get(tenant)
            .map_or(0, |lease| lease.borrowers.len())
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            tenants: state.leases.len(),
            borrowers: state.borrowers.len(),
            free: state.free_ids.len(),
            created: state.created,
        }
    }
}

impl<T: Hash + Eq + Clone + 'static> ResourcePool<T, u64> {
    /// Create a pool numbering ids 1, 2, 3, ...
    pub fn with_counter() -> Self {
        let mut next = 0u64;
        Self::new(move |_: &T| {
            next += 1;
            next
        })
    }
}

impl<T, I> Clone for ResourcePool<T, I> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T, I> fmt::Debug for ResourcePool<T, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ResourcePool")
            .field("tenants", &state.leases.len())
            .field("free", &state.free_ids.len())
            .field("created", &state.created)
            .finish()
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Tenants currently holding an id
    pub tenants: usize,
    /// Borrowers currently registered
    pub borrowers: usize,
    /// Ids waiting on the free list
    pub free: usize,
    /// Ids ever produced by the allocator
    pub created: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ResourcePool<String, u64> {
        ResourcePool::with_counter()
    }

    fn t(name: &str) -> String {
        name.to_string()
    }

    #[test]
    fn test_pool_creation() {
        let pool = pool();
        assert_eq!(
            pool.stats(),
            PoolStats {
                tenants: 0,
                borrowers: 0,
                free: 0,
                created: 0,
            }
        );
    }

    #[test]
    fn test_recycling() {
        let pool = pool();

        let x = pool.allocate(&t("t1"), "x");
        let y = pool.allocate(&t("t1"), "y");
        assert_eq!(x, y);
        assert_eq!(pool.borrower_count(&t("t1")), 2);

        assert!(pool.free("x"));
        assert_eq!(pool.id_of(&t("t1")), Some(x));

        assert!(pool.free("y"));
        assert_eq!(pool.id_of(&t("t1")), None);
        assert_eq!(pool.stats().free, 1);

        let reused = pool.allocate(&t("t2"), "z");
        assert_eq!(reused, x);
        assert_eq!(pool.stats().created, 1);
    }

    #[test]
    fn test_distinct_tenants_get_distinct_ids() {
        let pool = pool();

        let a = pool.allocate(&t("a"), "1");
        let b = pool.allocate(&t("b"), "1");
        assert_ne!(a, b);

        // One borrower on two tenants gives both back at once
        assert!(pool.free("1"));
        let stats = pool.stats();
        assert_eq!(stats.tenants, 0);
        assert_eq!(stats.free, 2);
    }

    #[test]
    fn test_free_pair() {
        let pool = pool();

        pool.allocate(&t("a"), "x");
        pool.allocate(&t("b"), "x");

        assert!(pool.free_pair(&t("a"), "x"));
        assert!(!pool.free_pair(&t("a"), "x"));
        assert_eq!(pool.id_of(&t("a")), None);
        assert!(pool.id_of(&t("b")).is_some());

        assert!(pool.free_pair(&t("b"), "x"));
        assert_eq!(pool.stats().borrowers, 0);
    }

    #[test]
    fn test_unknown_keys_are_noops() {
        let pool = pool();
        pool.allocate(&t("a"), "x");

        assert!(!pool.free("nobody"));
        assert!(!pool.free_pair(&t("missing"), "x"));
        assert!(!pool.free_pair(&t("a"), "nobody"));
        assert_eq!(pool.free_scope("no-such-scope"), 0);

        assert_eq!(pool.stats().tenants, 1);
    }

    #[test]
    fn test_free_is_idempotent() {
        let pool = pool();
        pool.allocate(&t("a"), "x");

        assert!(pool.free("x"));
        assert!(!pool.free("x"));
        assert_eq!(pool.stats().free, 1);
    }

    #[test]
    fn test_free_scope() {
        let pool = pool();

        pool.allocate_scoped("conn-1", &t("a"), "req-1");
        pool.allocate_scoped("conn-1", &t("b"), "req-2");
        pool.allocate_scoped("conn-2", &t("a"), "req-3");

        assert_eq!(pool.free_scope("conn-1"), 2);
        assert_eq!(pool.id_of(&t("b")), None);
        // req-3 still keeps tenant a alive
        assert_eq!(pool.borrower_count(&t("a")), 1);

        assert_eq!(pool.free_scope("conn-1"), 0);
        assert_eq!(pool.free_scope("conn-2"), 1);
        assert_eq!(pool.stats().tenants, 0);
    }

    #[test]
    fn test_freed_borrower_leaves_scope() {
        let pool = pool();

        pool.allocate_scoped("conn", &t("a"), "req");
        assert!(pool.free("req"));
        assert_eq!(pool.free_scope("conn"), 0);
    }

    #[test]
    fn test_custom_allocator_sees_tenant() {
        let pool: ResourcePool<String, String> =
            ResourcePool::new(|tenant: &String| format!("{}-session", tenant));

        assert_eq!(pool.allocate(&t("db"), "x"), "db-session");

        pool.free("x");
        // Recycled ids keep the value they were created with
        assert_eq!(pool.allocate(&t("cache"), "y"), "db-session");
    }

    #[test]
    fn test_clone_shares_state() {
        let pool = pool();
        let other = pool.clone();

        pool.allocate(&t("a"), "x");
        assert_eq!(other.stats().tenants, 1);
        assert!(other.free("x"));
        assert_eq!(pool.stats().tenants, 0);
    }
}
