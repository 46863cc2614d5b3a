use crate::j2534::error::{PassThruError, Result};
use crate::j2534::types::{IoctlParameter, SConfig};

/// Ordered set of config parameters with unique ids.
///
/// Iteration follows insertion order; lookups are by parameter id. Used both
/// as the input of SET_CONFIG and as the result of GET_CONFIG.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigValues {
    entries: Vec<(IoctlParameter, u32)>,
}

impl ConfigValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from pairs, rejecting a repeated parameter id
    pub fn try_from_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (IoctlParameter, u32)>,
    {
        let mut values = Self::new();
        for (parameter, value) in pairs {
            values.insert(parameter, value)?;
        }
        Ok(values)
    }

    pub fn insert(&mut self, parameter: IoctlParameter, value: u32) -> Result<()> {
        if self.contains(parameter) {
            return Err(PassThruError::DuplicateParameter(parameter));
        }
        self.entries.push((parameter, value));
        Ok(())
    }

    pub fn get(&self, parameter: IoctlParameter) -> Option<u32> {
        self.entries
            .iter()
            .find(|(p, _)| *p == parameter)
            .map(|(_, v)| *v)
    }

    pub fn contains(&self, parameter: IoctlParameter) -> bool {
        self.entries.iter().any(|(p, _)| *p == parameter)
    }

    pub fn iter(&self) -> impl Iterator<Item = (IoctlParameter, u32)> + '_ {
        self.entries.iter().copied()
    }

    pub fn parameters(&self) -> impl Iterator<Item = IoctlParameter> + '_ {
        self.entries.iter().map(|(p, _)| *p)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// SCONFIG array in iteration order, ready for SET_CONFIG
    pub(crate) fn to_native(&self) -> Vec<SConfig> {
        self.entries
            .iter()
            .map(|(parameter, value)| SConfig {
                parameter: parameter.raw(),
                value: *value,
            })
            .collect()
    }

    /// Reads back an SCONFIG array filled in by GET_CONFIG
    pub(crate) fn from_native(configs: &[SConfig]) -> Result<Self> {
        let mut values = Self::new();
        for config in configs {
            let parameter = IoctlParameter::from_raw(config.parameter).ok_or_else(|| {
                PassThruError::Malformed(format!(
                    "unknown config parameter 0x{:X}",
                    config.parameter
                ))
            })?;
            values
                .insert(parameter, config.value)
                .map_err(|_| {
                    PassThruError::Malformed(format!("config parameter {} repeated", parameter))
                })?;
        }
        Ok(values)
    }
}

impl<'a> IntoIterator for &'a ConfigValues {
    type Item = (IoctlParameter, u32);
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, (IoctlParameter, u32)>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter().copied()
    }
}

/// SCONFIG array for a GET_CONFIG query: requested ids in order, values zeroed
pub(crate) fn query_list(parameters: &[IoctlParameter]) -> Result<Vec<SConfig>> {
    let mut configs: Vec<SConfig> = Vec::with_capacity(parameters.len());
    for parameter in parameters {
        if configs.iter().any(|c| c.parameter == parameter.raw()) {
            return Err(PassThruError::DuplicateParameter(*parameter));
        }
        configs.push(SConfig {
            parameter: parameter.raw(),
            value: 0,
        });
    }
    Ok(configs)
}

pub(crate) fn warn_reserved<I>(parameters: I)
where
    I: IntoIterator<Item = IoctlParameter>,
{
    for parameter in parameters {
        if parameter.is_reserved_for_interface() {
            log::warn!(
                "{} is reserved for the interface; drivers may reject it",
                parameter
            );
        }
    }
}
