/// Execute an aggregate command deterministically (no IO, no async).
///
/// Decides with `handle`, then applies each resulting event in order. Used by
/// unit tests and by the unit of work, which stages the returned events.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: quoteflow_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
