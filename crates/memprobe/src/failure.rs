//! The allocation-failure injection driver.

use crate::error::AllocError;
use crate::probe::ProbeResource;

/// Runs `f` under an allocation limit that starts at zero and grows by
/// one per iteration, until `f` survives without an injected failure.
///
/// Each iteration sets `resource`'s allocation limit to the iteration
/// number, runs `f`, and restores the original limit, so code outside
/// the loop always observes the limit it configured. A
/// [`AllocError::LimitExceeded`] owned by `resource` moves on to the
/// next iteration; any other error (including a limit failure injected
/// by some *other* resource) is returned as-is.
///
/// Every allocation path in `f` is thereby exercised with a failure at
/// least once, which is what shakes out cleanup bugs on the error
/// paths.
///
/// # Examples
///
/// ```rust
/// use memprobe::{check_allocation_failures, MemoryResource, ProbeResource, ResourceBox};
///
/// let probe = ProbeResource::new("loop");
/// check_allocation_failures(&probe, |r| {
///     let first = ResourceBox::new_in(r, [7u8; 24])?;
///     let second = ResourceBox::new_in(r, [7u8; 24])?;
///     assert_eq!(*first, *second);
///     Ok(())
/// })
/// .unwrap();
/// assert_eq!(probe.status(), 0);
/// ```
pub fn check_allocation_failures<F>(resource: &ProbeResource<'_>, mut f: F) -> Result<(), AllocError>
where
    F: FnMut(&ProbeResource<'_>) -> Result<(), AllocError>,
{
    let original_limit = resource.allocation_limit();
    let mut limit = 0i64;

    loop {
        resource.set_allocation_limit(limit);
        let outcome = f(resource);
        resource.set_allocation_limit(original_limit);

        match outcome {
            Ok(()) => return Ok(()),
            Err(AllocError::LimitExceeded { owner, bytes, align }) if owner == resource.id() => {
                if resource.is_verbose() {
                    resource.reporter().on_log(format_args!(
                        "  *** allocation limit = {limit}, last alloc size = {bytes}, align = {align} ***"
                    ));
                }
            }
            Err(err) => {
                if let AllocError::LimitExceeded { owner, .. } = err {
                    resource.reporter().on_log(format_args!(
                        "  *** allocation failure injected by an unexpected resource: {owner} ***"
                    ));
                }
                return Err(err);
            }
        }

        limit += 1;
    }
}
