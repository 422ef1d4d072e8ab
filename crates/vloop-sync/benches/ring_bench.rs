use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use crossbeam::queue::ArrayQueue;
use vloop_sync::MicrotaskRing;

const PRODUCERS: usize = 4;
const PER_PRODUCER: usize = 10_000;

fn bench_microtask_ring(c: &mut Criterion) {
    c.bench_function("ring_mpsc_4p", |b| {
        b.iter(|| {
            let ring = Arc::new(MicrotaskRing::with_capacity(4096));
            let mut handles = vec![];
            for _ in 0..PRODUCERS {
                let ring = ring.clone();
                handles.push(std::thread::spawn(move || {
                    for _ in 0..PER_PRODUCER {
                        ring.push(Box::new(|| {}));
                    }
                }));
            }
            let consumer = {
                let ring = ring.clone();
                std::thread::spawn(move || {
                    let mut drained = 0;
                    while drained < PRODUCERS * PER_PRODUCER {
                        if let Some(job) = ring.pop() {
                            job();
                            drained += 1;
                        } else {
                            std::hint::spin_loop();
                        }
                    }
                })
            };
            for h in handles {
                h.join().unwrap();
            }
            consumer.join().unwrap();
        });
    });
}

// Baseline: bounded crossbeam queue with spin-retry producers.
fn bench_crossbeam_array_queue(c: &mut Criterion) {
    c.bench_function("crossbeam_array_queue_4p", |b| {
        b.iter(|| {
            let queue: Arc<ArrayQueue<Box<dyn FnOnce() + Send>>> =
                Arc::new(ArrayQueue::new(4096));
            let mut handles = vec![];
            for _ in 0..PRODUCERS {
                let queue = queue.clone();
                handles.push(std::thread::spawn(move || {
                    for _ in 0..PER_PRODUCER {
                        let mut job: Box<dyn FnOnce() + Send> = Box::new(|| {});
                        while let Err(back) = queue.push(job) {
                            job = back;
                            std::hint::spin_loop();
                        }
                    }
                }));
            }
            let consumer = {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    let mut drained = 0;
                    while drained < PRODUCERS * PER_PRODUCER {
                        if let Some(job) = queue.pop() {
                            job();
                            drained += 1;
                        } else {
                            std::hint::spin_loop();
                        }
                    }
                })
            };
            for h in handles {
                h.join().unwrap();
            }
            consumer.join().unwrap();
        });
    });
}

criterion_group!(benches, bench_microtask_ring, bench_crossbeam_array_queue);
criterion_main!(benches);
