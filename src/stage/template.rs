//! Built-in build templates
//!
//! A template is a Dockerfile with `${name}` variables, the container ports it
//! declares and the defaults of its variables. The registry is a fixed table.

use crate::error::{Result, StoolError};
use crate::pool::Ports;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

/// Variable holding the memory in mb an app needs
pub const MEMORY: &str = "memory";

/// A build template
#[derive(Debug)]
pub struct Template {
    pub name: &'static str,
    /// File name of the artifact inside the build context
    pub artifact: &'static str,
    pub dockerfile: &'static str,
    /// Container ports of the resulting image
    pub ports: Ports,
    /// Variable names with their defaults
    pub variables: &'static [(&'static str, &'static str)],
}

const TOMCAT_DOCKERFILE: &str = r#"FROM tomcat:${tomcat}-jdk${java}
ARG memory=${memory}
ENV CATALINA_OPTS="-Xmx${heap}m -Dcom.sun.management.jmxremote.port=5555 -agentlib:jdwp=transport=dt_socket,server=y,suspend=n,address=*:5005"
RUN rm -rf /usr/local/tomcat/webapps/*
COPY ROOT.war /usr/local/tomcat/webapps/ROOT.war
EXPOSE 8080 8443 5555 5005
"#;

const PLAIN_DOCKERFILE: &str = r#"FROM eclipse-temurin:${java}-jre
ARG memory=${memory}
WORKDIR /app
COPY app.jar /app/app.jar
EXPOSE 8080
CMD ["java", "-Xmx${heap}m", "-jar", "/app/app.jar"]
"#;

/// All templates; the first one is the default for `.war` artifacts
pub static TEMPLATES: &[Template] = &[
    Template {
        name: "tomcat",
        artifact: "ROOT.war",
        dockerfile: TOMCAT_DOCKERFILE,
        ports: Ports {
            http: Some(8080),
            https: Some(8443),
            jmxmp: Some(5555),
            debug: Some(5005),
        },
        variables: &[("tomcat", "9.0"), ("java", "17"), (MEMORY, "1024"), ("heap", "768")],
    },
    Template {
        name: "plain",
        artifact: "app.jar",
        dockerfile: PLAIN_DOCKERFILE,
        ports: Ports {
            http: Some(8080),
            https: None,
            jmxmp: None,
            debug: None,
        },
        variables: &[("java", "17"), (MEMORY, "512"), ("heap", "384")],
    },
];

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("variable pattern"))
}

/// Find a template by name
pub fn lookup(name: &str) -> Result<&'static Template> {
    TEMPLATES
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| StoolError::UnknownProperty {
            name: format!("template {}", name),
            choices: TEMPLATES.iter().map(|t| t.name).collect::<Vec<_>>().join(", "),
        })
}

/// Template for an artifact: `tomcat` for `.war` files, `plain` otherwise
pub fn for_artifact(artifact: &Path) -> &'static Template {
    let war = artifact.extension().map_or(false, |ext| ext == "war");
    if war {
        &TEMPLATES[0]
    } else {
        &TEMPLATES[1]
    }
}

impl Template {
    /// Defaults merged with `overrides`; unknown names are rejected
    pub fn args(&self, overrides: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
        let mut result: BTreeMap<String, String> = self
            .variables
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        for (name, value) in overrides {
            if !result.contains_key(name) {
                return Err(StoolError::UnknownProperty {
                    name: format!("build argument {}", name),
                    choices: self.variables.iter().map(|(n, _)| *n).collect::<Vec<_>>().join(", "),
                });
            }
            result.insert(name.clone(), value.clone());
        }
        Ok(result)
    }

    /// Memory in mb as configured by `args`
    pub fn memory(&self, args: &BTreeMap<String, String>) -> Result<u64> {
        let value = args.get(MEMORY).map(String::as_str).unwrap_or("0");
        crate::config::property::parse(MEMORY, value)
    }

    /// Dockerfile with all known variables replaced
    pub fn render(&self, args: &BTreeMap<String, String>) -> String {
        variable_pattern()
            .replace_all(self.dockerfile, |caps: &Captures| {
                args.get(&caps[1]).cloned().unwrap_or_else(|| caps[0].to_string())
            })
            .to_string()
    }

    /// Generate the build context in `dir` from `artifact`.
    ///
    /// The context is assembled next to `dir` and moved into place at the end,
    /// so `dir` either holds the complete new context or is left unchanged.
    pub fn write_context(&self, dir: &Path, artifact: &Path, args: &BTreeMap<String, String>) -> Result<()> {
        if !artifact.is_file() {
            return Err(StoolError::InvalidProperty {
                name: "artifact".to_string(),
                message: format!("file not found: {}", artifact.display()),
            });
        }
        let tmp = dir.with_extension("tmp");
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        let assembled = (|| -> Result<()> {
            fs::create_dir_all(&tmp)?;
            fs::write(tmp.join("Dockerfile"), self.render(args))?;
            fs::copy(artifact, tmp.join(self.artifact))?;
            Ok(())
        })();
        if let Err(e) = assembled {
            let _ = fs::remove_dir_all(&tmp);
            return Err(e);
        }
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::rename(&tmp, dir)?;
        debug!("Build context ready in {}", dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_lookup() {
        assert_eq!(lookup("tomcat").unwrap().name, "tomcat");
        assert!(matches!(lookup("jetty"), Err(StoolError::UnknownProperty { .. })));
        assert_eq!(for_artifact(Path::new("app.war")).name, "tomcat");
        assert_eq!(for_artifact(Path::new("app.jar")).name, "plain");
    }

    #[test]
    fn test_args_and_render() {
        let tomcat = lookup("tomcat").unwrap();
        let resolved = tomcat.args(&args(&[("memory", "2048")])).unwrap();
        assert_eq!(tomcat.memory(&resolved).unwrap(), 2048);
        assert_eq!(resolved["java"], "17");

        let dockerfile = tomcat.render(&resolved);
        assert!(dockerfile.starts_with("FROM tomcat:9.0-jdk17\n"));
        assert!(dockerfile.contains("ARG memory=2048"));
        assert!(!dockerfile.contains("${"));

        assert!(tomcat.args(&args(&[("colour", "red")])).is_err());
        let broken = tomcat.args(&args(&[("memory", "much")])).unwrap();
        assert!(tomcat.memory(&broken).is_err());
    }

    #[test]
    fn test_write_context() {
        let tmp = tempdir().unwrap();
        let artifact = tmp.path().join("app.war");
        fs::write(&artifact, b"war").unwrap();
        let dir = tmp.path().join("context").join("web");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stale"), b"x").unwrap();

        let tomcat = lookup("tomcat").unwrap();
        let resolved = tomcat.args(&BTreeMap::new()).unwrap();
        tomcat.write_context(&dir, &artifact, &resolved).unwrap();
        assert!(dir.join("Dockerfile").is_file());
        assert_eq!(fs::read(dir.join("ROOT.war")).unwrap(), b"war");
        assert!(!dir.join("stale").exists());

        // a missing artifact leaves the previous context alone
        let err = tomcat.write_context(&dir, &tmp.path().join("missing.war"), &resolved);
        assert!(err.is_err());
        assert!(dir.join("ROOT.war").is_file());
    }
}
