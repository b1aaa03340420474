use crate::face_detector::FaceBox;

/// How to pick one face when the detector reports several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// The first box in detector output order.
    ///
    /// Positional, not size- or confidence-based. Detector order is usually
    /// scan order, so this is not necessarily the most prominent face.
    #[default]
    First,

    /// The box with the largest area; the earliest one wins ties.
    Largest,
}

impl SelectionPolicy {
    /// Pick one face, or `None` when the detector found nothing.
    pub fn select(self, faces: &[FaceBox]) -> Option<FaceBox> {
        match self {
            SelectionPolicy::First => select_first(faces),
            SelectionPolicy::Largest => select_largest(faces),
        }
    }
}

/// First element of the detector output, if any.
pub fn select_first(faces: &[FaceBox]) -> Option<FaceBox> {
    faces.first().copied()
}

/// Largest-area face; ties resolve to the earliest.
pub fn select_largest(faces: &[FaceBox]) -> Option<FaceBox> {
    faces
        .iter()
        .copied()
        .reduce(|best, face| if face.area() > best.area() { face } else { best })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn faces() -> Vec<FaceBox> {
        vec![
            FaceBox::new(300, 10, 210, 210),
            FaceBox::new(0, 0, 400, 400),
            FaceBox::new(50, 500, 400, 400),
        ]
    }

    #[test]
    fn empty_input_selects_nothing() {
        assert_eq!(select_first(&[]), None);
        assert_eq!(SelectionPolicy::Largest.select(&[]), None);
    }

    #[test]
    fn first_ignores_size() {
        assert_eq!(select_first(&faces()), Some(FaceBox::new(300, 10, 210, 210)));
    }

    #[test]
    fn first_is_stable_across_runs() {
        let faces = faces();
        let picks: Vec<_> = (0..10).map(|_| select_first(&faces)).collect();
        assert!(picks.iter().all(|p| *p == picks[0]));
    }

    #[test]
    fn largest_prefers_earliest_on_tie() {
        assert_eq!(
            SelectionPolicy::Largest.select(&faces()),
            Some(FaceBox::new(0, 0, 400, 400))
        );
    }

    #[test]
    fn default_policy_is_first() {
        assert_eq!(SelectionPolicy::default(), SelectionPolicy::First);
        assert_eq!(
            SelectionPolicy::default().select(&faces()),
            select_first(&faces())
        );
    }
}
