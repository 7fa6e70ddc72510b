use crate::connection_info::ConnectionInfoSnapshot;
use rustc_hash::FxHashMap;
use std::net::IpAddr;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;
use tracing::{debug, trace};

const DEFAULT_CACHE_SIZE: usize = 64;

struct CacheEntry {
    snapshot: ConnectionInfoSnapshot,
    last_used: Instant,
}

/// Process-wide bounded cache of connection estimates, keyed by remote IP.
/// A new connection to a previously seen address starts from the cached RTT
/// and bandwidth figures instead of the cold defaults. Eviction is least
/// recently used.
pub struct ConnectionsInfoCache {
    max_size: usize,
    entries: Mutex<FxHashMap<IpAddr, CacheEntry>>,
}

impl ConnectionsInfoCache {
    pub fn new(max_size: usize) -> ConnectionsInfoCache {
        ConnectionsInfoCache {
            max_size,
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn lookup(&self, addr: IpAddr) -> Option<ConnectionInfoSnapshot> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&addr) {
            trace!("seeding connection to {:?} from cached estimates", addr);
            entry.last_used = Instant::now();
            Some(entry.snapshot)
        } else {
            None
        }
    }

    pub fn update(&self, addr: IpAddr, snapshot: ConnectionInfoSnapshot) {
        let mut entries = self.entries.lock().unwrap();

        if !entries.contains_key(&addr) && entries.len() >= self.max_size {
            if let Some(&oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(addr, _)| addr)
            {
                debug!("connections cache full - evicting {:?}", oldest);
                entries.remove(&oldest);
            }
        }

        entries.insert(
            addr,
            CacheEntry {
                snapshot,
                last_used: Instant::now(),
            },
        );
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// the process-wide cache instance
pub fn connections_cache() -> &'static ConnectionsInfoCache {
    static CACHE: OnceLock<ConnectionsInfoCache> = OnceLock::new();
    CACHE.get_or_init(|| ConnectionsInfoCache::new(DEFAULT_CACHE_SIZE))
}
