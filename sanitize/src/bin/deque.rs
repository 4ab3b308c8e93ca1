use std::sync::Arc;
use std::thread;

use anchor_deque::{epoch, LockFreeDeque};
use rand::Rng;

fn leak_test() {
    let d = Arc::new(LockFreeDeque::new());

    let threads = (0..8)
        .map(|t| {
            let d = d.clone();

            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for i in 0..100_000 {
                    match rng.gen_range(0..t + 2) {
                        0 => drop(d.try_pop_left()),
                        1 => drop(d.try_pop_right()),
                        _ if i % 2 == 0 => d.push_left(Box::new(i)),
                        _ => d.push_right(Box::new(i)),
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for t in threads {
        t.join().unwrap();
    }

    // Whatever is left is freed by the deque's destructor.
    drop(d);
    epoch::flush();
}

fn main() {
    leak_test();
}
