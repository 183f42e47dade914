use std::future::Future;
use std::marker::PhantomData;

use async_singleflight::Group;

/// Coalesces concurrent builds for the same key into a single in-flight
/// call, via `async_singleflight`'s `Group`. Used anywhere the spec requires
/// "at most one build/dial/listener creation in flight for a given key" —
/// the cert cache and the fake-server pool both have this requirement.
///
/// `Group` keys on `&str`, so callers key this by a `String`/`&str`-like
/// type; a caller wanting a richer key should format it to a string first.
pub struct SingleFlight<K, V: Clone, E: Clone> {
	group: Group<String, V, E>,
	_key: PhantomData<fn(K)>,
}

impl<K, V: Clone, E: Clone> Default for SingleFlight<K, V, E> {
	fn default() -> Self {
		Self { group: Group::new(), _key: PhantomData }
	}
}

impl<K, V, E> SingleFlight<K, V, E>
where
	K: AsRef<str>,
	V: Clone,
	E: Clone,
{
	pub fn new() -> Self {
		Self::default()
	}

	/// Run `init` for `key` if no build is in flight; otherwise await the
	/// in-flight build's result. Returns the same `Result` to every waiter.
	pub async fn get_or_try_init<F, Fut>(&self, key: K, init: F) -> Result<V, E>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<V, E>> + Send,
	{
		self.group.work(key.as_ref(), init()).await.map_err(|e| e.unwrap())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[tokio::test]
	async fn concurrent_calls_build_once() {
		let sf: Arc<SingleFlight<&'static str, u32, ()>> = Arc::new(SingleFlight::new());
		let calls = Arc::new(AtomicUsize::new(0));

		let mut handles = Vec::new();
		for _ in 0..16 {
			let sf = sf.clone();
			let calls = calls.clone();
			handles.push(tokio::spawn(async move {
				sf.get_or_try_init("host", || async {
					calls.fetch_add(1, Ordering::SeqCst);
					tokio::time::sleep(std::time::Duration::from_millis(20)).await;
					Ok::<_, ()>(42u32)
				})
				.await
			}));
		}
		for h in handles {
			assert_eq!(h.await.unwrap(), Ok(42));
		}
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn sequential_calls_rebuild() {
		let sf: SingleFlight<&'static str, u32, ()> = SingleFlight::new();
		let calls = Arc::new(AtomicUsize::new(0));
		for _ in 0..3 {
			let calls = calls.clone();
			sf.get_or_try_init("host", || async {
				calls.fetch_add(1, Ordering::SeqCst);
				Ok::<_, ()>(1u32)
			})
			.await
			.unwrap();
		}
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}
}
