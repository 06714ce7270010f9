use core::time::Duration;

/// Number of remote DSP cores addressable by a proxy.
pub const MAX_CORES: u32 = 4;

/// Core number reserved for the host-side proxy in a message address.
pub const PROXY_CORE: u8 = 0xF;

/// Maximum number of client handles per proxy (8-bit client field, 0 reserved).
pub const MAX_CLIENTS: usize = 255;

/// Number of ports addressable per component (4-bit port field).
pub const MAX_PORTS: u8 = 16;

/// Size of one message record on the wire, in bytes.
pub const WIRE_MESSAGE_SIZE: usize = 16;

/// Shared-memory address value meaning "no buffer".
pub const SHMEM_NULL: u32 = u32::MAX;

/// Default size of the region shared between host and DSP (1 MiB).
pub const DEFAULT_SHMEM_SIZE: usize = 1 << 20;

/// Fraction of shared memory handed to the host heap; the rest is the DSP heap.
pub const HOST_HEAP_SHARE: usize = 2;

/// Alignment of every allocation carved out of shared memory.
pub const SHMEM_ALIGN: usize = 64;

/// Bytes reserved in front of each pool item for its membership header.
pub const POOL_ITEM_HEADER: usize = 8;

/// Default number of AUX (control payload) buffers per proxy.
pub const AUX_POOL_BUFFERS: usize = 16;

/// Default size of one AUX buffer in bytes.
pub const AUX_BUFFER_SIZE: usize = 256;

/// Default number of message slots in the DSP-side message pool.
pub const MSG_POOL_SIZE: usize = 256;

/// Size of one message slot in DSP-local memory (record plus intrusive link).
pub const MSG_SLOT_SIZE: usize = 24;

/// Default DSP-local scratch memory available to the message pool.
pub const DSP_LOCAL_MEMORY: usize = 64 * 1024;

/// Slots in each remote-proc vring. Usable capacity is one less.
pub const VRING_SLOTS: usize = 64;

/// Number of readiness polls performed while opening a transport.
pub const OPEN_RETRIES: u32 = 50;

/// Delay between readiness polls while opening a transport.
pub const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(2);

/// Longest single transport wait performed while pumping responses.
pub const POLL_SLICE: Duration = Duration::from_millis(5);

/// Default timeout for synchronous control-plane round trips.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
