use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU16, Ordering};

use url::Url;

const RANGE_START: u16 = 20_000;
const RANGE_LEN: u16 = 20_000;

/// Next candidate port. Seeded randomly so separate test binaries running at
/// the same time start from different places.
static NEXT_PORT: AtomicU16 = AtomicU16::new(0);

fn seed() -> u16 {
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u32(std::process::id());
    #[allow(clippy::cast_possible_truncation)]
    let offset = (hasher.finish() % u64::from(RANGE_LEN)) as u16;
    RANGE_START + offset
}

fn next_candidate() -> u16 {
    let _ = NEXT_PORT.compare_exchange(0, seed(), Ordering::SeqCst, Ordering::SeqCst);

    let port = NEXT_PORT.fetch_add(1, Ordering::SeqCst);
    if port >= RANGE_START + RANGE_LEN || port < RANGE_START {
        NEXT_PORT.store(RANGE_START + 1, Ordering::SeqCst);
        return RANGE_START;
    }
    port
}

/// Allocates a port that is free on the loopback interface right now and has
/// not been handed out before by this process.
///
/// # Panics
///
/// Panics if no free port is found in the whole range.
#[must_use]
pub fn allocate_port() -> u16 {
    for _ in 0..RANGE_LEN {
        let port = next_candidate();
        if is_port_available(port) {
            return port;
        }
    }

    panic!("no free port in {RANGE_START}..{}", RANGE_START + RANGE_LEN)
}

/// Whether a port can currently be bound on the loopback interface.
#[must_use]
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).is_ok()
}

/// Allocates a loopback socket address.
#[must_use]
pub fn allocate_socket_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], allocate_port()))
}

/// Allocates a loopback `http://` URL.
///
/// # Panics
///
/// Panics if no free port is found.
#[must_use]
pub fn allocate_http_url() -> Url {
    let addr = allocate_socket_addr();
    Url::parse(&format!("http://{addr}")).unwrap_or_else(|e| panic!("bad url for {addr}: {e}"))
}
