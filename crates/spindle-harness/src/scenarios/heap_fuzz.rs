//! Heap torture: allocate, pattern-fill, realloc-churn, verify.

use spindle_core::heap;

use crate::check;
use crate::error::ScenarioError;
use crate::report::ScenarioReport;
use crate::Lcg;

const CHUNKS: usize = 256;
const MAX_SIZE: usize = 2 * 4096;
const REALLOCS_PER_ITER: usize = 50;

struct TrackedChunk {
    ptr: *mut u8,
    size: usize,
}

/// Fill `[ptr, ptr+len)` with the chunk's tag byte.
fn fill(ptr: *mut u8, from: usize, to: usize, tag: u8) {
    // SAFETY: callers pass offsets within the chunk's current allocation.
    unsafe {
        for off in from..to {
            *ptr.add(off) = tag;
        }
    }
}

fn verify(chunk: &TrackedChunk, tag: u8) -> bool {
    // SAFETY: ptr/size track the live allocation exactly.
    unsafe {
        for off in 0..chunk.size {
            if *chunk.ptr.add(off) != tag {
                return false;
            }
        }
    }
    true
}

/// Run the heap fuzz: `CHUNKS` allocations with random sizes, then
/// `iterations` rounds of reallocating 50 random chunks each, verifying
/// every chunk's fill pattern after every round.
pub fn run(iterations: usize, seed: u32) -> Result<ScenarioReport, ScenarioError> {
    let mut report = ScenarioReport::new("heap-fuzz");
    let mut rng = Lcg::new(seed);
    let baseline = heap::state();

    let mut chunks = Vec::with_capacity(CHUNKS);
    for i in 0..CHUNKS {
        let size = rng.below(MAX_SIZE as u32) as usize;
        let ptr = heap::alloc(size);
        check!(!ptr.is_null(), "allocation {i} of {size} bytes failed");
        fill(ptr, 0, size, i as u8);
        chunks.push(TrackedChunk { ptr, size });
    }
    report.note(format!("allocated {CHUNKS} chunks up to {MAX_SIZE} bytes"));

    for iter in 0..iterations {
        for _ in 0..REALLOCS_PER_ITER {
            let idx = rng.below(CHUNKS as u32) as usize;
            let new_size = rng.below(MAX_SIZE as u32) as usize;
            let chunk = &mut chunks[idx];
            // SAFETY: chunk.ptr is live and owned by this scenario.
            let new_ptr = unsafe { heap::realloc(chunk.ptr, new_size) };
            check!(
                !new_ptr.is_null(),
                "realloc to {new_size} failed at iteration {iter}"
            );
            if new_size > chunk.size {
                fill(new_ptr, chunk.size, new_size, idx as u8);
            }
            chunk.ptr = new_ptr;
            chunk.size = new_size;
        }
        for (idx, chunk) in chunks.iter().enumerate() {
            check!(
                verify(chunk, idx as u8),
                "chunk {idx} corrupted after iteration {iter}"
            );
        }
        if iter % 1000 == 0 {
            log::debug!("heap fuzz iteration {iter}: all {CHUNKS} chunks intact");
        }
    }
    report.note(format!(
        "{iterations} iterations x {REALLOCS_PER_ITER} reallocs verified"
    ));

    for chunk in &chunks {
        // SAFETY: each tracked pointer is live exactly once.
        unsafe { heap::free(chunk.ptr) };
    }
    let end = heap::state();
    check!(
        end.allocated == baseline.allocated,
        "allocated chunks leaked: {} at start, {} at end",
        baseline.allocated,
        end.allocated
    );
    report.note(format!(
        "final heap state: {} chunks carved, {} allocated",
        end.chunks, end.allocated
    ));
    Ok(report)
}
