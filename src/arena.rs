use std::{
    marker::PhantomData,
    mem::{self, ManuallyDrop, MaybeUninit},
    ptr,
};

use parking_lot::Mutex;
use log::trace;

/// Capacity of a single command chunk, in bytes.
pub const CHUNK_BYTES: usize = 32 * 1024;

/// Alignment of the chunk buffer. Every node offset is aligned
/// relative to the buffer start, so this is also the largest
/// alignment a recorded command may require.
pub const CHUNK_ALIGN: usize = 64;

/// Upper bound on the arena footprint of a single recorded
/// command, header included. Keeping this at half the chunk
/// capacity guarantees that a command rejected by a partially
/// filled chunk always fits into an empty one, which is what
/// lets the scheduler flush and retry exactly once.
pub const MAX_COMMAND_BYTES: usize = CHUNK_BYTES / 2;

// Commands are stored type-erased: each node embeds two thunks
// instantiated for the concrete closure type, one that moves the
// closure out and invokes it, and one that only drops it (used
// when a chunk is discarded without being replayed). The `next`
// pointer lives inside the node itself, so recording a command
// costs one in-place construction and one pointer store, with no
// side table of node addresses.
type ExecuteFn<C> = unsafe fn(*mut NodeHeader<C>, &mut C);
type DropFn<C> = unsafe fn(*mut NodeHeader<C>);

#[repr(C)]
struct NodeHeader<C> {
    execute: ExecuteFn<C>,
    drop: DropFn<C>,
    next: *mut NodeHeader<C>,
}

#[repr(C)]
struct Node<C, F> {
    header: NodeHeader<C>,
    command: ManuallyDrop<F>,
}

unsafe fn execute_node<C, F: FnOnce(&mut C)>(node: *mut NodeHeader<C>, context: &mut C) {
    let node = node as *mut Node<C, F>;
    let command = ManuallyDrop::take(&mut (*node).command);
    command(context);
}

unsafe fn drop_node<C, F>(node: *mut NodeHeader<C>) {
    let node = node as *mut Node<C, F>;
    ManuallyDrop::drop(&mut (*node).command);
}

// Evaluated once per closure type when `record` is
// instantiated; an oversized or over-aligned command is a
// compile error, never a runtime branch.
struct NodeLayout<C, F>(PhantomData<(C, F)>);

impl<C, F> NodeLayout<C, F> {
    const CHECK: () = {
        assert!(
            mem::size_of::<Node<C, F>>() <= MAX_COMMAND_BYTES,
            "recorded command exceeds MAX_COMMAND_BYTES"
        );
        assert!(
            mem::align_of::<Node<C, F>>() <= CHUNK_ALIGN,
            "recorded command requires a larger alignment than the chunk buffer provides"
        );
    };
}

#[repr(C, align(64))]
struct ChunkStorage([MaybeUninit<u8>; CHUNK_BYTES]);

/// A fixed-capacity bump arena holding a linked sequence of
/// type-erased command closures, replayed in insertion order
/// against an execution context `C`.
pub struct CommandChunk<C> {
    storage: Box<ChunkStorage>,
    write_offset: usize,
    first: *mut NodeHeader<C>,
    last: *mut NodeHeader<C>,
}

// The raw node pointers only ever point into `storage`, which
// the chunk owns, and `record` requires every stored closure to
// be `Send`; the chunk as a whole can therefore move between
// the producer and the recording worker.
unsafe impl<C> Send for CommandChunk<C> {}

impl<C> CommandChunk<C> {
    pub fn new() -> Self {
        Self {
            storage: Box::new(ChunkStorage([MaybeUninit::uninit(); CHUNK_BYTES])),
            write_offset: 0,
            first: ptr::null_mut(),
            last: ptr::null_mut(),
        }
    }

    /// Append a command to the chunk. On success the chunk has
    /// taken ownership of the closure; if the chunk is too full
    /// to hold it, the closure is handed back unchanged and the
    /// chunk is left exactly as it was.
    pub fn record<F>(&mut self, command: F) -> Result<(), F>
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        let () = NodeLayout::<C, F>::CHECK;

        // The node must start at an offset aligned for its own
        // type; the buffer start is 64-byte aligned, so aligning
        // the offset is enough. Padding bytes stay uninitialized.
        let offset = align_up(self.write_offset, mem::align_of::<Node<C, F>>());
        if offset + mem::size_of::<Node<C, F>>() > CHUNK_BYTES {
            return Err(command);
        }

        unsafe {
            let node = self.storage.0.as_mut_ptr().add(offset) as *mut Node<C, F>;
            node.write(Node {
                header: NodeHeader {
                    execute: execute_node::<C, F>,
                    drop: drop_node::<C, F>,
                    next: ptr::null_mut(),
                },
                command: ManuallyDrop::new(command),
            });

            // Link the node after the current tail, or make it
            // the head of an empty chunk.
            let header = node as *mut NodeHeader<C>;
            if self.last.is_null() {
                self.first = header;
            } else {
                (*self.last).next = header;
            }
            self.last = header;
        }

        self.write_offset = offset + mem::size_of::<Node<C, F>>();
        Ok(())
    }

    /// Replay every stored command in insertion order, running
    /// each closure's destructor in the process, then reset the
    /// chunk to empty.
    pub fn execute_all(&mut self, context: &mut C) {
        // The head advances before each invocation, so if a
        // command panics the drop glue only sees the commands
        // that have not been consumed yet.
        while !self.first.is_null() {
            unsafe {
                let node = self.first;
                self.first = (*node).next;
                ((*node).execute)(node, context);
            }
        }

        self.write_offset = 0;
        self.last = ptr::null_mut();
    }

    pub fn is_empty(&self) -> bool {
        self.write_offset == 0 && self.first.is_null()
    }
}

impl<C> Default for CommandChunk<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Drop for CommandChunk<C> {
    fn drop(&mut self) {
        // A chunk discarded before replay still owns its
        // closures; run their destructors without invoking them.
        let mut node = self.first;
        while !node.is_null() {
            unsafe {
                let next = (*node).next;
                ((*node).drop)(node);
                node = next;
            }
        }
    }
}

/// A LIFO reserve of drained chunks. The most recently released
/// chunk is handed out first, as its buffer is the most likely
/// to still be cache-resident.
pub struct ChunkPool<C> {
    reserve: Mutex<Vec<CommandChunk<C>>>,
}

impl<C> ChunkPool<C> {
    pub fn new() -> Self {
        Self {
            reserve: Mutex::new(Vec::new()),
        }
    }

    /// Pop a reserved chunk, or allocate a fresh one if the
    /// reserve is empty. The lock is held only for the pop.
    pub fn acquire(&self) -> CommandChunk<C> {
        if let Some(chunk) = self.reserve.lock().pop() {
            return chunk;
        }

        trace!("Chunk reserve empty, allocating a new chunk.");
        CommandChunk::new()
    }

    pub fn release(&self, chunk: CommandChunk<C>) {
        debug_assert!(chunk.is_empty(), "released chunk still holds commands");
        self.reserve.lock().push(chunk);
    }

    pub fn reserved(&self) -> usize {
        self.reserve.lock().len()
    }
}

impl<C> Default for ChunkPool<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn replays_in_insertion_order() {
        let mut chunk = CommandChunk::<Vec<u32>>::new();
        for i in 0..100 {
            chunk.record(move |log: &mut Vec<u32>| log.push(i)).ok().unwrap();
        }

        let mut log = Vec::new();
        chunk.execute_all(&mut log);

        assert_eq!(log, (0..100).collect::<Vec<_>>());
        assert!(chunk.is_empty());
    }

    #[test]
    fn chunk_can_be_refilled_after_replay() {
        let mut chunk = CommandChunk::<Vec<u32>>::new();
        let mut log = Vec::new();

        chunk.record(|log: &mut Vec<u32>| log.push(1)).ok().unwrap();
        chunk.execute_all(&mut log);
        chunk.record(|log: &mut Vec<u32>| log.push(2)).ok().unwrap();
        chunk.execute_all(&mut log);

        assert_eq!(log, vec![1, 2]);
    }

    #[test]
    fn full_chunk_rejects_without_side_effects() {
        let mut chunk = CommandChunk::<Vec<u32>>::new();

        // Each command captures a 4 KiB payload, so only a
        // handful fit; keep recording until one is rejected.
        let mut accepted = 0;
        loop {
            let payload = [0u8; 4096];
            let result = chunk.record(move |log: &mut Vec<u32>| {
                log.push(payload[0] as u32);
            });
            if result.is_err() {
                break;
            }
            accepted += 1;
        }

        let offset_after_reject = chunk.write_offset;
        assert!(accepted > 0);
        assert!(offset_after_reject <= CHUNK_BYTES);

        // The rejected record must not have advanced the cursor
        // or grown the chain.
        let mut log = Vec::new();
        chunk.execute_all(&mut log);
        assert_eq!(log.len(), accepted);
    }

    #[test]
    fn offsets_are_aligned_for_the_stored_command() {
        #[repr(align(32))]
        #[derive(Clone, Copy)]
        struct Overaligned(u64);

        let mut chunk = CommandChunk::<Vec<u64>>::new();

        // A one-byte command first, to leave the cursor at an
        // odd offset for the over-aligned one.
        let tiny = 7u8;
        chunk
            .record(move |log: &mut Vec<u64>| log.push(tiny as u64))
            .ok()
            .unwrap();
        let misaligned_cursor = chunk.write_offset;

        let value = Overaligned(42);
        chunk
            .record(move |log: &mut Vec<u64>| log.push(value.0))
            .ok()
            .unwrap();
        assert_eq!(align_up(misaligned_cursor, 32) % 32, 0);
        assert!(chunk.write_offset > misaligned_cursor);

        let mut log = Vec::new();
        chunk.execute_all(&mut log);
        assert_eq!(log, vec![7, 42]);
    }

    #[test]
    fn dropping_an_unexecuted_chunk_drops_its_commands() {
        struct Token(Arc<AtomicUsize>);
        impl Drop for Token {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let mut chunk = CommandChunk::<()>::new();
        for _ in 0..3 {
            let token = Token(drops.clone());
            chunk
                .record(move |_: &mut ()| {
                    let _keep = &token;
                })
                .ok()
                .unwrap();
        }

        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(chunk);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn executed_commands_are_dropped_exactly_once() {
        struct Token(Arc<AtomicUsize>);
        impl Drop for Token {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let mut chunk = CommandChunk::<()>::new();
        let token = Token(drops.clone());
        chunk
            .record(move |_: &mut ()| {
                let _keep = &token;
            })
            .ok()
            .unwrap();

        chunk.execute_all(&mut ());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        drop(chunk);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pool_reuses_released_chunks() {
        let pool = ChunkPool::<Vec<u32>>::new();
        let chunk = pool.acquire();
        assert_eq!(pool.reserved(), 0);

        pool.release(chunk);
        assert_eq!(pool.reserved(), 1);

        let _again = pool.acquire();
        assert_eq!(pool.reserved(), 0);
    }
}
