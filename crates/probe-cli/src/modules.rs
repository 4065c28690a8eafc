//! Startup module registry: named modules with dependency lists,
//! instantiated in depth-first topological order.

use anyhow::{bail, Result};

pub struct ModuleDef {
    pub name: &'static str,
    pub deps: &'static [&'static str],
}

/// The payload's module graph, leaves first by dependency.
pub fn payload_modules() -> Vec<ModuleDef> {
    vec![
        ModuleDef {
            name: "telemetry",
            deps: &[],
        },
        ModuleDef {
            name: "store",
            deps: &[],
        },
        ModuleDef {
            name: "calibration",
            deps: &[],
        },
        ModuleDef {
            name: "sdr",
            deps: &["telemetry", "calibration"],
        },
        ModuleDef {
            name: "switcher",
            deps: &["store", "calibration", "telemetry", "sdr"],
        },
        ModuleDef {
            name: "mission",
            deps: &["switcher", "telemetry"],
        },
    ]
}

/// Depth-first topological order over the module graph. Errors on unknown
/// dependencies and cycles.
pub fn boot_order(modules: &[ModuleDef]) -> Result<Vec<&'static str>> {
    fn visit(
        name: &'static str,
        modules: &[ModuleDef],
        done: &mut Vec<&'static str>,
        visiting: &mut Vec<&'static str>,
    ) -> Result<()> {
        if done.contains(&name) {
            return Ok(());
        }
        if visiting.contains(&name) {
            bail!("module dependency cycle through {name:?}");
        }
        let Some(module) = modules.iter().find(|m| m.name == name) else {
            bail!("unknown module dependency {name:?}");
        };
        visiting.push(name);
        for dep in module.deps {
            visit(dep, modules, done, visiting)?;
        }
        visiting.pop();
        done.push(name);
        Ok(())
    }

    let mut done = Vec::with_capacity(modules.len());
    let mut visiting = Vec::new();
    for m in modules {
        visit(m.name, modules, &mut done, &mut visiting)?;
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_order_puts_dependencies_first() {
        let order = boot_order(&payload_modules()).unwrap();
        assert_eq!(order.len(), 6);
        let pos = |n: &str| order.iter().position(|m| *m == n).unwrap();
        assert!(pos("telemetry") < pos("sdr"));
        assert!(pos("calibration") < pos("sdr"));
        assert!(pos("sdr") < pos("switcher"));
        assert!(pos("switcher") < pos("mission"));
    }

    #[test]
    fn cycle_is_detected() {
        let modules = vec![
            ModuleDef {
                name: "a",
                deps: &["b"],
            },
            ModuleDef {
                name: "b",
                deps: &["a"],
            },
        ];
        assert!(boot_order(&modules).is_err());
    }

    #[test]
    fn unknown_dependency_is_an_error() {
        let modules = vec![ModuleDef {
            name: "a",
            deps: &["missing"],
        }];
        assert!(boot_order(&modules).is_err());
    }
}
