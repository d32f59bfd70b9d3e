use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use xpdep::*;
use xpdep::global::fs::{Fs, OsFs};

const PROVIDER_AWS: &str = r#"apiVersion: meta.pkg.crossplane.io/v1
kind: Provider
metadata:
  name: provider-aws
"#;

const PROVIDER_HELM: &str = r#"apiVersion: meta.pkg.crossplane.io/v1
kind: Provider
metadata:
  name: provider-helm
"#;

const PLATFORM: &str = r#"apiVersion: meta.pkg.crossplane.io/v1
kind: Configuration
metadata:
  name: platform
spec:
  dependsOn:
    - provider: xpkg.upbound.io/crossplane-contrib/provider-helm
      version: ">=v0.15.0"
    - configuration: acme/networking
---
apiVersion: apiextensions.crossplane.io/v1
kind: CompositeResourceDefinition
metadata:
  name: xclusters.acme.io
"#;

const NETWORKING: &str = r#"apiVersion: meta.pkg.crossplane.io/v1
kind: Configuration
metadata:
  name: networking
spec:
  dependsOn:
    - provider: docker.io/crossplane/provider-aws
      version: "~v0.20"
"#;

fn setup_tests() -> (TempDir, Arc<Local>, Arc<LocalResolver>) {
    let temp_dir = TempDir::new().unwrap();
    let cache = Local::new(CacheConfig {
        root: temp_dir.path().join("cache"),
        ..CacheConfig::default()
    })
    .unwrap();

    let mut resolver = LocalResolver::new();
    let mut publish = |reference: &str, yaml: &str| {
        let r = PackageRef::parse(reference).unwrap();
        resolver.insert(&r, Artifact::from_package_yaml(yaml).unwrap());
    };
    publish("crossplane/provider-aws:v0.19.0", PROVIDER_AWS);
    publish("crossplane/provider-aws:v0.20.1", PROVIDER_AWS);
    publish("crossplane/provider-aws:v0.21.0", PROVIDER_AWS);
    publish("xpkg.upbound.io/crossplane-contrib/provider-helm:v0.15.0", PROVIDER_HELM);
    publish("xpkg.upbound.io/crossplane-contrib/provider-helm:v0.16.0", PROVIDER_HELM);
    publish("acme/networking:v1.0.0", NETWORKING);
    publish("acme/platform:v2.3.0", PLATFORM);

    (temp_dir, Arc::new(cache), Arc::new(resolver))
}

fn files(root: &Path) -> usize {
    OsFs.walk(root).map(|f| f.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup() {
        let (dir, cache, _) = setup_tests();
        assert!(dir.path().exists());
        assert_eq!(cache.root(), dir.path().join("cache"));
        assert!(cache.list().unwrap().is_empty());
    }

    #[test]
    fn test_add_all_writes_entry_on_disk() {
        let (dir, cache, resolver) = setup_tests();
        let manager = Manager::new(cache.clone(), resolver.clone());

        let (pinned, pkg) = manager
            .add_all(&Dependency::parse("crossplane/provider-aws@<v0.21.0").unwrap())
            .unwrap();

        assert_eq!(pinned.constraints, "v0.20.1");
        assert_eq!(pkg.name(), "provider-aws");
        let entry = dir
            .path()
            .join("cache/index.docker.io/crossplane/provider-aws@v0.20.1");
        assert!(entry.join(METADATA_FILE).exists());
        assert!(entry.join(IMAGE_FILE).exists());
        assert_eq!(files(cache.root()), 2);
    }

    #[test]
    fn test_second_run_is_served_from_cache() {
        let (_dir, cache, resolver) = setup_tests();
        let manager = Manager::new(cache.clone(), resolver.clone());
        let dep = Dependency::parse("docker.io/crossplane/provider-aws").unwrap();

        let first = manager.add_all(&dep).unwrap();
        let second = manager.add_all(&dep).unwrap();

        assert_eq!(first.0.constraints, "v0.21.0");
        assert_eq!(first, second);
        assert_eq!(resolver.fetch_count(), 1);
        assert_eq!(
            cache.list().unwrap(),
            vec!["index.docker.io/crossplane/provider-aws@v0.21.0"]
        );
    }

    #[test]
    fn test_transitive_resolution() {
        let (_dir, cache, resolver) = setup_tests();
        let manager = Manager::new(cache.clone(), resolver);

        let resolved = manager
            .add_with_dependencies(&Dependency::parse("acme/platform").unwrap())
            .unwrap();
        let pinned: Vec<String> = resolved.iter().map(|(d, _)| d.to_string()).collect();

        assert_eq!(
            pinned,
            vec![
                "acme/platform@v2.3.0",
                "xpkg.upbound.io/crossplane-contrib/provider-helm@v0.16.0",
                "acme/networking@v1.0.0",
                "docker.io/crossplane/provider-aws@v0.20.1",
            ]
        );
        assert_eq!(cache.list().unwrap().len(), 4);
    }

    #[test]
    fn test_sync_workspace_and_record_pin() {
        let (dir, cache, resolver) = setup_tests();
        let project = dir.path().join("project");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join(META_FILE), PLATFORM.split("---").next().unwrap()).unwrap();

        let mut ws = Workspace::load(&project).unwrap();
        let deps = ws.meta().unwrap().depends_on().unwrap();
        let manager = Manager::new(cache.clone(), resolver);
        let resolved = manager.add_many(&deps).unwrap();
        assert_eq!(resolved.len(), 2);

        let mut meta = ws.meta().unwrap().clone();
        meta.upsert(&resolved[0].0).unwrap();
        ws.write(&meta).unwrap();

        let reloaded = Workspace::load(&project).unwrap();
        let declared = reloaded.meta().unwrap().depends_on().unwrap();
        assert_eq!(declared[0].constraints, "v0.16.0");
        assert_eq!(declared[1].constraints, DEFAULT_CONSTRAINT);
    }

    #[test]
    fn test_clean_removes_everything() {
        let (dir, cache, resolver) = setup_tests();
        let manager = Manager::new(cache.clone(), resolver);
        manager
            .add_all(&Dependency::parse("crossplane/provider-aws@v0.19.0").unwrap())
            .unwrap();
        assert_eq!(files(cache.root()), 2);

        cache.clean().unwrap();

        assert!(cache.list().unwrap().is_empty());
        assert_eq!(files(dir.path()), 0);
        assert_eq!(std::fs::read_dir(cache.root()).unwrap().count(), 0);
    }
}
