use fail::FailScenario;

/// Configures fail points until dropped.
///
/// Holding the scenario also serializes tests that use fail points, since they are process
/// global.
pub struct CustomFailScenario<'a> {
    _scenario: FailScenario<'a>,
    failpoints: Vec<(String, String)>,
}

impl<'a> CustomFailScenario<'a> {
    pub fn setup(failpoints: &[(&str, &str)]) -> CustomFailScenario<'a> {
        let scenario = FailScenario::setup();
        let failpoints = failpoints
            .iter()
            .map(|(name, action)| (name.to_string(), action.to_string()))
            .collect::<Vec<_>>();

        for (name, action) in failpoints.iter() {
            fail::cfg(name, action).unwrap()
        }

        Self {
            _scenario: scenario,
            failpoints,
        }
    }

    /// Turns a single fail point off before the scenario ends.
    pub fn disable(&self, name: &str) {
        fail::cfg(name, "off").unwrap()
    }

    pub fn teardown(self) {
        drop(self);
    }
}

impl<'a> Drop for CustomFailScenario<'a> {
    fn drop(&mut self) {
        for (name, _) in self.failpoints.iter() {
            fail::cfg(name, "off").unwrap()
        }
    }
}
