//! Shows what the diagnostics layer reports for buggy callers: a leaked
//! allocation, a double free and a foreign pointer.

use fitheap::TrackedHeap;

fn main() {
    let mut heap = TrackedHeap::new(64 * 1024).expect("initial growth failed");

    let kept = heap.allocate(48).expect("out of memory");
    let _leaked = heap.allocate(256).expect("out of memory");

    heap.release(kept.as_ptr()).unwrap();

    // Second release of the same pointer.
    if let Err(err) = heap.release(kept.as_ptr()) {
        println!("caught: {err}");
    }

    // A pointer that never came from this heap.
    let mut local = 0u64;
    if let Err(err) = heap.release((&mut local as *mut u64).cast()) {
        println!("caught: {err}");
    }

    print!("{}", heap.check_leaks());
}
