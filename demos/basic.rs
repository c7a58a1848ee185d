//! Allocates 30 growing blocks from a private heap, frees them in reverse
//! and shows the page groups coming and going.

use pgalloc::Heap;

const COUNT: usize = 30;
const REQUEST_SIZE: usize = 200;

fn main() {
    let mut heap = Heap::new();
    let mut ptrs = Vec::with_capacity(COUNT);
    let mut accumulator = 0;

    for i in 0..COUNT {
        let len = REQUEST_SIZE * (i + 1);
        accumulator += len;

        match heap.allocate(len) {
            Ok(ptr) => {
                println!("Allocated {len} bytes at {ptr:p}! Total: {accumulator} [{i}]");
                ptrs.push(ptr);
            }
            Err(err) => {
                eprintln!("Failed to allocate {len} bytes: {err}");
                std::process::exit(1);
            }
        }
    }

    println!("{:#?}", heap.stats());

    for ptr in ptrs.into_iter().rev() {
        heap.free(Some(ptr)).expect("pointer came from this heap");
    }

    println!("After freeing everything: {:#?}", heap.stats());
}
