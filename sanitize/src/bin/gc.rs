use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::Arc;
use std::thread;

use anchor_deque::epoch::{self, Atomic};
use rand::Rng;

fn worker(a: Arc<Atomic<AtomicUsize>>) {
    let mut rng = rand::thread_rng();
    let mut sum = 0usize;

    for _ in 0..1000 {
        epoch::pin(|pin| {
            let val = if rng.gen_range(0..100) < 10 {
                let old = a.swap(Box::new(AtomicUsize::new(sum)), AcqRel, pin);
                let val = old.as_ref().map_or(0, |v| v.load(Relaxed));
                unsafe { epoch::defer_drop(old.as_raw(), pin) }
                val
            } else {
                a.load(Acquire, pin)
                    .as_ref()
                    .map_or(0, |v| v.fetch_add(sum, Relaxed))
            };

            sum = sum.wrapping_add(val);
        });

        // Threads that come and go exercise registration and the hand-off of their bags.
        if rng.gen_range(0..1010) == 0 {
            let a = a.clone();
            thread::spawn(move || worker(a)).join().unwrap();
        }
    }
}

fn main() {
    let a = Arc::new(Atomic::new(AtomicUsize::new(777)));

    let threads = (0..10)
        .map(|_| {
            let a = a.clone();
            thread::spawn(move || worker(a))
        })
        .collect::<Vec<_>>();

    for t in threads {
        t.join().unwrap();
    }

    epoch::pin(|pin| unsafe { drop(Box::from_raw(a.load(Relaxed, pin).as_raw())) });
    epoch::flush();
}
