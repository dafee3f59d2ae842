mod common;

use common::{ARM64, Project, RewritingEditor, dylib};
use pybundler_core::compile::SourceCompiler;
use pybundler_core::macho::MachoFile;
use pybundler_core::{BuildError, BuildSummary, NullReporter, Pipeline};
use pybundler_schema::BuildConfig;
use std::fs;
use std::os::unix::fs::PermissionsExt;

fn build(project: &Project, config: &BuildConfig) -> Result<BuildSummary, BuildError> {
    Pipeline::new(config, &NullReporter)
        .with_interpreter(project.interp.clone())
        .with_compiler(Box::new(SourceCompiler))
        .with_editor(Box::new(RewritingEditor::default()))
        .build()
}

fn info_plist(summary: &BuildSummary) -> plist::Dictionary {
    let value = plist::Value::from_file(summary.bundle.join("Contents/Info.plist")).unwrap();
    value.into_dictionary().unwrap()
}

#[test]
fn test_single_script_standalone_app() {
    let project = Project::new();
    project.write("main.py", "import os\nprint(os.path.abspath(__file__))\n");
    project.stdlib_file("os.py", "import sys\nimport posixpath as path\n");
    project.stdlib_file("posixpath.py", "");
    let config = project.config("app = [\"main.py\"]");

    let summary = build(&project, &config).unwrap();
    let contents = project.path("dist/main.app/Contents");
    assert_eq!(summary.bundle, project.path("dist/main.app"));

    let exe = contents.join("MacOS/main");
    assert_eq!(fs::metadata(&exe).unwrap().permissions().mode() & 0o777, 0o755);
    assert!(contents.join("Resources/main.py").is_file());
    assert_eq!(fs::read_to_string(contents.join("PkgInfo")).unwrap(), "APPL????");

    let members = project.zip_members(&contents.join("Resources/lib/python3.12/site-packages.zip"));
    assert_eq!(members, ["os.py", "posixpath.py"]);

    let plist = info_plist(&summary);
    assert_eq!(plist["CFBundleExecutable"].as_string(), Some("main"));
    assert_eq!(plist["CFBundlePackageType"].as_string(), Some("APPL"));
    assert!(plist.contains_key("PyRuntimeLocations"));
    assert!(plist.contains_key("PyResourcePackages"));

    let boot = fs::read_to_string(contents.join("Resources/__boot__.py")).unwrap();
    assert!(boot.contains("DEFAULT_SCRIPT = \"main.py\""));
    assert!(summary.audit.unwrap().is_clean());
}

#[test]
fn test_pure_source_package_goes_to_zip() {
    let project = Project::new();
    project.write("main.py", "import tinypkg\n");
    project.site_file("tinypkg/__init__.py", b"from .core import VALUE\n");
    project.site_file("tinypkg/core.py", b"VALUE = 1\n");
    project.site_file("tinypkg/data.json", b"{}");
    let config = project.config("app = [\"main.py\"]");

    let summary = build(&project, &config).unwrap();
    let pylib = summary.bundle.join("Contents/Resources/lib/python3.12");
    let members = project.zip_members(&pylib.join("site-packages.zip"));
    assert_eq!(members, ["tinypkg/__init__.py", "tinypkg/core.py", "tinypkg/data.json"]);
    assert_eq!(summary.emit.extensions, 0);
    assert!(!pylib.join("lib-dynload").exists());
}

#[test]
fn test_native_extension_is_relocated() {
    let project = Project::new();
    let lib = project.path("vendor/libfoo.1.dylib");
    let lib_name = lib.to_str().unwrap().to_string();
    project.write_bytes(
        "vendor/libfoo.1.dylib",
        &dylib(ARM64, Some(&lib_name), &["/usr/lib/libSystem.B.dylib"], &[]),
    );
    project.site_file("fastmath/__init__.py", b"from . import _speedups\n");
    project.site_file(
        "fastmath/_speedups.cpython-312-darwin.so",
        &dylib(ARM64, None, &[&lib_name, "/usr/lib/libSystem.B.dylib"], &[]),
    );
    project.write("main.py", "import fastmath\n");
    let config = project.config("app = [\"main.py\"]");

    let summary = build(&project, &config).unwrap();
    let contents = summary.bundle.join("Contents");
    let ext = contents.join("Resources/lib/python3.12/lib-dynload/fastmath._speedups.so");
    assert!(ext.is_file());
    assert!(contents.join("Frameworks/libfoo.1.dylib").is_file());

    let ext = MachoFile::open(&ext).unwrap().unwrap();
    let deps: Vec<&str> = ext.dependencies().iter().map(|d| d.name.as_str()).collect();
    assert_eq!(deps, ["@rpath/libfoo.1.dylib", "/usr/lib/libSystem.B.dylib"]);
    assert_eq!(ext.rpaths(), ["@loader_path/../../../../Frameworks"]);

    let bundled = MachoFile::open(&contents.join("Frameworks/libfoo.1.dylib")).unwrap().unwrap();
    assert_eq!(bundled.install_name(), Some("@rpath/libfoo.1.dylib"));

    let members = project.zip_members(&contents.join("Resources/lib/python3.12/site-packages.zip"));
    assert_eq!(members, ["fastmath/__init__.py"]);
    let audit = summary.audit.unwrap();
    assert!(audit.is_clean(), "{audit:?}");
    assert_eq!(audit.binaries.len(), 2);
}

#[test]
fn test_missing_library_fails_before_writing() {
    let project = Project::new();
    project.site_file(
        "broken/_impl.cpython-312-darwin.so",
        &dylib(ARM64, None, &["/nonexistent/libgone.dylib"], &[]),
    );
    project.site_file("broken/__init__.py", b"from . import _impl\n");
    project.write("main.py", "import broken\n");
    let config = project.config("app = [\"main.py\"]");

    let err = build(&project, &config).unwrap_err();
    assert!(matches!(err, BuildError::Relocation(_)), "{err}");
    assert!(!project.path("dist/main.app").exists());
}

#[test]
fn test_plugin_bundle() {
    let project = Project::new();
    project.write("plug.py", "X = 1\n");
    let config = project.config(
        r#"
plugin = ["plug.py"]
extension = ".bundle"

[plist]
NSPrincipalClass = "MyPlugin"
CFBundlePackageType = "XXXX"
"#,
    );

    let summary = build(&project, &config).unwrap();
    assert_eq!(summary.bundle, project.path("dist/plug.bundle"));
    let plist = info_plist(&summary);
    assert_eq!(plist["NSPrincipalClass"].as_string(), Some("MyPlugin"));
    assert_eq!(plist["CFBundlePackageType"].as_string(), Some("BNDL"));
    assert_eq!(
        fs::read_to_string(summary.bundle.join("Contents/PkgInfo")).unwrap(),
        "BNDL????"
    );
    let boot = fs::read_to_string(summary.bundle.join("Contents/Resources/__boot__.py")).unwrap();
    assert!(boot.contains("macosx_plugin"));
}

#[test]
fn test_multi_entry_launchers() {
    let project = Project::new();
    project.write("main.py", "print('main')\n");
    project.write("tool.py", "print('tool')\n");
    let config = project.config("app = [\"main.py\"]\nextra_scripts = [\"tool.py\"]");

    let summary = build(&project, &config).unwrap();
    let macos = summary.bundle.join("Contents/MacOS");
    assert_eq!(fs::read(macos.join("tool")).unwrap(), fs::read(macos.join("main")).unwrap());

    let resources = summary.bundle.join("Contents/Resources");
    assert!(resources.join("tool.py").is_file());
    let boot = fs::read_to_string(resources.join("__boot__.py")).unwrap();
    assert!(boot.contains("SCRIPT_MAP = {\"main\":\"main.py\",\"tool\":\"tool.py\"}"));
}

#[test]
fn test_alias_build_points_at_sources() {
    let project = Project::new();
    project.write("src/main.py", "import tinypkg\n");
    project.site_file("tinypkg/__init__.py", b"");
    let config = project.config("app = [\"src/main.py\"]\nalias = true");

    let summary = build(&project, &config).unwrap();
    let resources = summary.bundle.join("Contents/Resources");
    assert!(!resources.join("lib").exists());
    assert!(!resources.join("main.py").exists());
    assert!(summary.audit.is_none());

    let src = fs::canonicalize(project.path("src")).unwrap();
    let boot = fs::read_to_string(resources.join("__boot__.py")).unwrap();
    assert!(boot.contains(&format!("_path_inject([\"{}\"])", src.display())));
    assert!(boot.contains(&format!("DEFAULT_SCRIPT = \"{}\"", src.join("main.py").display())));

    let plist = info_plist(&summary);
    let info = plist["PythonInfoDict"].as_dictionary().unwrap();
    assert_eq!(info["mode"].as_string(), Some("alias"));
}

#[test]
fn test_missing_modules() {
    let project = Project::new();
    project.write("main.py", "import nowhere\n");

    let config = project.config("app = [\"main.py\"]");
    let err = build(&project, &config).unwrap_err();
    match err {
        BuildError::Discovery(names) => assert_eq!(names, ["nowhere"]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(build(&project, &config).unwrap_err().exit_code(), 1);

    let config = project.config("app = [\"main.py\"]\nexpected_missing = [\"nowhere\"]");
    assert!(build(&project, &config).is_ok());
}

#[test]
fn test_config_errors_precede_filesystem_work() {
    let project = Project::new();
    let config = project.config("app = [\"missing.py\"]");
    let err = build(&project, &config).unwrap_err();
    assert!(matches!(err, BuildError::Config(_)), "{err}");
    assert!(!project.path("dist").exists());
}

#[test]
fn test_rebuild_is_idempotent() {
    let project = Project::new();
    project.write("main.py", "import tinypkg\n");
    project.site_file("tinypkg/__init__.py", b"VALUE = 2\n");
    let config = project.config("app = [\"main.py\"]");

    let first = build(&project, &config).unwrap();
    let zip = first.bundle.join("Contents/Resources/lib/python3.12/site-packages.zip");
    let plist = first.bundle.join("Contents/Info.plist");
    let boot = first.bundle.join("Contents/Resources/__boot__.py");
    let before = [fs::read(&zip).unwrap(), fs::read(&plist).unwrap(), fs::read(&boot).unwrap()];

    build(&project, &config).unwrap();
    let after = [fs::read(&zip).unwrap(), fs::read(&plist).unwrap(), fs::read(&boot).unwrap()];
    assert_eq!(before, after);
}

#[test]
fn test_dylib_excludes_stay_outside_the_bundle() {
    let project = Project::new();
    let lib = project.path("vendor/libgl.dylib");
    let lib_name = lib.to_str().unwrap().to_string();
    project.write_bytes("vendor/libgl.dylib", &dylib(ARM64, Some(&lib_name), &[], &[]));
    project.site_file("gfx/__init__.py", b"from . import _gl\n");
    project.site_file("gfx/_gl.cpython-312-darwin.so", &dylib(ARM64, None, &[&lib_name], &[]));
    project.write("main.py", "import gfx\n");
    let config = project.config("app = [\"main.py\"]\ndylib_excludes = [\"libgl*\"]");

    let summary = build(&project, &config).unwrap();
    let contents = summary.bundle.join("Contents");
    assert!(!contents.join("Frameworks/libgl.dylib").exists());
    let ext = contents.join("Resources/lib/python3.12/lib-dynload/gfx._gl.so");
    let ext = MachoFile::open(&ext).unwrap().unwrap();
    assert_eq!(ext.dependencies()[0].name, lib_name);
    let audit = summary.audit.unwrap();
    assert!(audit.is_clean(), "{audit:?}");
}

#[test]
fn test_bundled_binaries_are_stripped_unless_disabled() {
    let project = Project::new();
    let lib = project.path("vendor/libfoo.1.dylib");
    let lib_name = lib.to_str().unwrap().to_string();
    project.write_bytes("vendor/libfoo.1.dylib", &dylib(ARM64, Some(&lib_name), &[], &[]));
    project.site_file(
        "fastmath/_speedups.cpython-312-darwin.so",
        &dylib(ARM64, None, &[&lib_name], &[]),
    );
    project.site_file("fastmath/__init__.py", b"from . import _speedups\n");
    project.write("main.py", "import fastmath\n");

    let run = |body: &str| {
        let editor = RewritingEditor::default();
        let config = project.config(body);
        let summary = Pipeline::new(&config, &NullReporter)
            .with_interpreter(project.interp.clone())
            .with_compiler(Box::new(SourceCompiler))
            .with_editor(Box::new(editor.clone()))
            .build()
            .unwrap();
        let stripped = editor.stripped.lock().unwrap().clone();
        (summary, stripped)
    };

    let (summary, stripped) = run("app = [\"main.py\"]");
    let contents = summary.bundle.join("Contents");
    assert_eq!(stripped.len(), 2, "{stripped:?}");
    assert!(stripped.contains(&contents.join("Frameworks/libfoo.1.dylib")));
    assert!(stripped.contains(&contents.join("Resources/lib/python3.12/lib-dynload/fastmath._speedups.so")));
    assert!(!stripped.contains(&contents.join("MacOS/main")));

    let (_, stripped) = run("app = [\"main.py\"]\nstrip = false");
    assert!(stripped.is_empty());
}

#[test]
fn test_faulthandler_is_bundled_and_enabled() {
    let project = Project::new();
    project.write("main.py", "print('hi')\n");
    project.stdlib_file("faulthandler.py", "");
    let config = project.config("app = [\"main.py\"]\nuse_faulthandler = true");

    let summary = build(&project, &config).unwrap();
    let resources = summary.bundle.join("Contents/Resources");
    let members = project.zip_members(&resources.join("lib/python3.12/site-packages.zip"));
    assert_eq!(members, ["faulthandler.py"]);
    let boot = fs::read_to_string(resources.join("__boot__.py")).unwrap();
    assert!(boot.contains("faulthandler.enable()"));
    let options = info_plist(&summary)["PyOptions"].as_dictionary().unwrap().clone();
    assert_eq!(options["use_faulthandler"].as_boolean(), Some(true));
}

#[test]
fn test_conditional_import_reporting_can_be_silenced() {
    let project = Project::new();
    project.write(
        "main.py",
        "try:\n    import optional_speedups\nexcept ImportError:\n    pass\n",
    );

    let config = project.config("app = [\"main.py\"]");
    assert_eq!(build(&project, &config).unwrap().warnings, 1);

    let config = project.config("app = [\"main.py\"]\nreport_missing_conditional_imports = false");
    assert_eq!(build(&project, &config).unwrap().warnings, 0);
}
