use std::collections::BTreeMap;

pub type Map = BTreeMap<String, String>;

/// The labels of a node whose keys fall under the topology prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyLabels(Map);

// === impl TopologyLabels ===

impl TopologyLabels {
    pub fn from_node_labels(prefix: &str, labels: &Map) -> Self {
        labels
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Returns true if every topology label is set on `labels` with the same
    /// value.
    pub fn is_satisfied_by(&self, labels: &Map) -> bool {
        self.0.iter().all(|(key, value)| labels.get(key) == Some(value))
    }

    /// Overwrites topology keys in `labels`. Other keys are left untouched.
    pub fn merge_into(&self, labels: &mut Map) {
        labels.extend(self.0.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

impl AsRef<Map> for TopologyLabels {
    #[inline]
    fn as_ref(&self) -> &Map {
        &self.0
    }
}

impl std::iter::FromIterator<(String, String)> for TopologyLabels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
