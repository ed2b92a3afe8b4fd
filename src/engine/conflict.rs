use crate::model::*;

/// First confirmed booking on the candidate's field and date whose span
/// overlaps the candidate. Cancelled rows never block.
///
/// Overlap on half-open spans covers all three shapes: the existing booking
/// contains the candidate's start, contains its end, or lies inside it.
/// Touching endpoints are not a conflict.
pub(crate) fn find_conflict<'a>(candidate: &Candidate, existing: &'a [Booking]) -> Option<&'a Booking> {
    existing.iter().find(|b| {
        b.is_confirmed()
            && b.field_id == candidate.field_id
            && b.date == candidate.date
            && b.span.overlaps(&candidate.span)
    })
}
