//! End-to-end walkthrough: allocate, write, inspect, release, audit.

use fitheap::TrackedHeap;

fn main() {
    let mut heap = TrackedHeap::new(1024 * 1024).expect("initial growth failed");

    let numbers = heap.allocate(10 * size_of::<i32>()).expect("out of memory");
    let string = heap.allocate(100).expect("out of memory");

    unsafe {
        let ints = numbers.as_ptr().cast::<i32>();
        for i in 0..10 {
            ints.add(i).write(i as i32);
        }

        let greeting = b"Hello, World!";
        string.as_ptr().copy_from_nonoverlapping(greeting.as_ptr(), greeting.len());
    }

    println!("{}", heap.stats());

    heap.release(numbers.as_ptr()).unwrap();
    heap.release(string.as_ptr()).unwrap();

    println!("{}", heap.check_leaks());
}
