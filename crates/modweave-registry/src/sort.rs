use std::cmp::Ordering;

/// Orders mods for startup load and bulk installs: descending priority
/// bands; within a band, mods without requirements come first, then
/// ascending requirement count (heavier dependents load later, after
/// whatever they depend on).
pub fn sort_mods<M>(mods: &mut [M], key: impl Fn(&M) -> (i64, usize)) {
    mods.sort_by(|a, b| {
        let (priority_a, requirements_a) = key(a);
        let (priority_b, requirements_b) = key(b);
        priority_b
            .cmp(&priority_a)
            .then_with(|| compare_requirements(requirements_a, requirements_b))
    });
}

fn compare_requirements(a: usize, b: usize) -> Ordering {
    (a > 0).cmp(&(b > 0)).then(a.cmp(&b))
}
