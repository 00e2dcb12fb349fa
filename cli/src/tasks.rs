use std::sync::Arc;

use sluice::err;
use sluice::error::Result;
use sluice::events::EventBus;
use sluice::graph::{Mode, Node, TaskGraph};
use sluice::pipeline::Pipeline;
use sluice::source::SourcePattern;
use sluice::transform::*;
use sluice::watch::WatchBinding;

use crate::config::Settings;

/// Runs `build`, then serves the output and rebuilds on change.
pub const WATCH: &str = "watch";

/// Pipelines rebuilt by `watch` when their sources change.
pub const WATCHED: &[&str] = &["styles", "scripts", "markup", "images", "fonts", "favicon"];

/// The built-in pipelines and tasks plus those the config adds.
pub struct Tasks {
    pub graph: TaskGraph,
    pub bus: EventBus,
}

impl Tasks {
    pub fn new(settings: &Settings) -> Result<Self> {
        let bus = EventBus::default();
        let pipelines = pipelines(settings, &bus)?;
        let graph = TaskGraph::new(pipelines, nodes(settings)?)?;
        Ok(Tasks { graph, bus })
    }

    pub fn watch_bindings(&self) -> Vec<WatchBinding> {
        WATCHED.iter()
            .filter_map(|name| self.graph.pipeline(name))
            .map(|pipeline| WatchBinding::new(pipeline.clone()))
            .collect()
    }
}

fn pipelines(settings: &Settings, bus: &EventBus) -> Result<Vec<Arc<Pipeline>>> {
    let (src, out) = (settings.source_dir(), settings.output_dir());
    let paths = &settings.paths;
    let dev = !settings.is_production();

    let styles = Pipeline::new("styles", SourcePattern::glob(src.join(&paths.styles), "styles.scss")?, out.join("css"))
        .watch(SourcePattern::glob(src.join(&paths.styles), "**/*.scss")?)
        .map(Sass::default())
        .map(Autoprefix::default())
        .map(Rename::to("styles.min.css"))
        .map(MinifyCss::default());

    let scripts = Pipeline::new("scripts", SourcePattern::glob(src.join(&paths.scripts), "*.js")?, out.join("js"))
        .watch(SourcePattern::glob(src.join(&paths.scripts), "**/*.js")?)
        .map(Include::rigger())
        .map(MinifyJs::suffixed(".min"));

    let mut markup = Pipeline::new("markup", SourcePattern::glob(src.join(&paths.pages), "*.html")?, &out)
        .watch(SourcePattern::glob(src.join(&paths.pages), "**/*.html")?)
        .map(Include::html());

    if !dev {
        markup = markup.map(Tidy);
    }

    let mut optimize = Optimize::new().jpeg_quality(settings.images.jpeg_quality);
    if let Some(max) = settings.images.max_bytes {
        optimize = optimize.max_bytes(max);
    }

    let images = Pipeline::new("images", SourcePattern::glob(src.join(&paths.images), "**/*.{jpg,jpeg,png,svg}")?, out.join("img"))
        .map(optimize)
        .map(SvgMin);

    let fonts = Pipeline::new("fonts", SourcePattern::glob(src.join(&paths.fonts), "**/*.{woff,woff2}")?, out.join("fonts"))
        .map(Passthrough);

    let favicon = Pipeline::new("favicon", SourcePattern::glob(src.join(&paths.favicon), "*.*")?, out.join("favicon"))
        .map(Passthrough);

    let sprite = Pipeline::new("sprite", SourcePattern::glob(src.join(&paths.sprite), "*.svg")?, out.join("img"))
        .map(SvgMin)
        .merge(SvgStore::default());

    let webp = Pipeline::new("webp", SourcePattern::glob(src.join(&paths.images), "**/*.{jpg,jpeg,png}")?, out.join("img"))
        .map(Webp);

    let pipelines = [styles, scripts, markup, images, fonts, favicon, sprite, webp];
    Ok(pipelines.into_iter()
        .map(|p| p.reload(dev).on_error(settings.on_error).events(bus.clone()))
        .map(Arc::new)
        .collect())
}

fn nodes(settings: &Settings) -> Result<Vec<Node>> {
    let mut nodes = vec![
        Node::new("build")
            .pipelines(["styles", "scripts", "images", "fonts", "markup", "favicon"])
            .mode(Mode::Parallel),
        Node::new("sprite").pipelines(["sprite"]),
        Node::new("webp").pipelines(["webp"]),
    ];

    let mut custom: Vec<_> = settings.tasks.iter().collect();
    custom.sort_by(|a, b| a.0.cmp(b.0));
    for (name, spec) in custom {
        if name == WATCH {
            return err!("task name is reserved", "task" => name);
        }

        nodes.push(Node::new(name.as_str())
            .pipelines(spec.pipelines.iter().map(String::as_str))
            .mode(spec.mode)
            .depends_on(spec.depends_on.iter().map(String::as_str)));
    }

    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use sluice::graph::Policy;

    use super::*;
    use crate::config::{Profile, TaskSpec};

    fn settings(root: &Path) -> Settings {
        Settings { root: root.to_path_buf(), profile: Profile::Production, ..Settings::default() }
    }

    fn write(root: &Path, path: &str, contents: &[u8]) {
        let path = root.join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir).unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();

        names.sort();
        names
    }

    #[test]
    fn styles_compile_to_one_minified_sheet() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/styles/styles.scss", b"@import \"blocks/colors\";\n.a { color: $primary; }\n.b { user-select: none; }\n");
        write(dir.path(), "src/styles/blocks/_colors.scss", b"$primary: red;\n");

        let tasks = Tasks::new(&settings(dir.path())).unwrap();
        let report = tasks.graph.run("build", Policy::Continue).unwrap();
        assert!(report.success(), "{report}");

        assert_eq!(listing(&dir.path().join("build/css")), ["styles.min.css"]);
        let css = std::fs::read_to_string(dir.path().join("build/css/styles.min.css")).unwrap();
        assert!(css.contains(".a{color:red}"), "{css}");
        assert!(css.contains(".b{-webkit-user-select:none;user-select:none}"), "{css}");
    }

    #[test]
    fn build_runs_every_pipeline_over_nested_sources() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/styles/styles.scss", b"@import \"blocks/header/header\";\n");
        write(dir.path(), "src/styles/blocks/header/_header.scss", b".h { margin: 0; }\n");
        write(dir.path(), "src/js/main.js", b"//= vendor/lib.js\nvar answer = 42; // the answer\n");
        write(dir.path(), "src/js/vendor/lib.js", b"function lib() { return 1; }\n");
        write(dir.path(), "src/pages/index.html", b"<body>@@include('partials/nav.html')</body>");
        write(dir.path(), "src/pages/partials/nav.html", b"<nav>home</nav>");
        write(dir.path(), "src/img/icons/logo.svg", b"<svg xmlns=\"http://www.w3.org/2000/svg\">\n  <!-- logo -->\n  <rect/>\n</svg>");
        write(dir.path(), "src/fonts/sans/regular.woff2", b"wOF2");
        write(dir.path(), "src/favicon/favicon.ico", b"ico");

        let tasks = Tasks::new(&settings(dir.path())).unwrap();
        let report = tasks.graph.run("build", Policy::Continue).unwrap();
        assert!(report.success(), "{report}");

        let build = dir.path().join("build");
        assert_eq!(listing(&build.join("css")), ["styles.min.css"]);
        assert_eq!(listing(&build.join("js")), ["main.js", "main.min.js"]);
        assert_eq!(listing(&build.join("img/icons")), ["logo.svg"]);
        assert_eq!(listing(&build.join("fonts/sans")), ["regular.woff2"]);
        assert_eq!(listing(&build.join("favicon")), ["favicon.ico"]);
        assert!(build.join("index.html").is_file());

        let min = std::fs::read_to_string(build.join("js/main.min.js")).unwrap();
        assert_eq!(min, "function lib(){return 1;}\nvar answer=42;");
    }

    #[test]
    fn images_pipeline_keeps_only_images() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("src/img");
        std::fs::create_dir_all(&img).unwrap();
        image::RgbImage::from_pixel(8, 8, image::Rgb([200, 30, 30])).save(img.join("a.png")).unwrap();
        image::RgbImage::from_pixel(8, 8, image::Rgb([30, 30, 200])).save(img.join("b.jpg")).unwrap();
        write(dir.path(), "src/img/c.txt", b"not an image");

        let tasks = Tasks::new(&settings(dir.path())).unwrap();
        let report = tasks.graph.run("build", Policy::Continue).unwrap();
        assert!(report.success(), "{report}");
        assert_eq!(listing(&dir.path().join("build/img")), ["a.png", "b.jpg"]);

        let report = tasks.graph.run("webp", Policy::Continue).unwrap();
        assert!(report.success(), "{report}");
        assert_eq!(listing(&dir.path().join("build/img")), ["a.png", "a.webp", "b.jpg", "b.webp"]);
    }

    #[test]
    fn pages_include_partials() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/pages/index.html", b"<body>@@include('partials/nav.html')</body>");
        write(dir.path(), "src/pages/partials/nav.html", b"<nav>home</nav>");

        let tasks = Tasks::new(&settings(dir.path())).unwrap();
        assert!(tasks.graph.run("build", Policy::Continue).unwrap().success());

        let html = std::fs::read_to_string(dir.path().join("build/index.html")).unwrap();
        assert!(html.contains("<nav>home</nav>"), "{html}");
        assert!(!dir.path().join("build/partials").exists());
    }

    #[test]
    fn config_tasks_join_the_graph() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.tasks.insert("assets".into(), TaskSpec {
            pipelines: vec!["images".into(), "fonts".into()],
            mode: Mode::Sequential,
            depends_on: vec!["sprite".into()],
        });

        let tasks = Tasks::new(&settings).unwrap();
        let names: Vec<&str> = tasks.graph.nodes().map(|n| n.name()).collect();
        assert_eq!(names, ["build", "sprite", "webp", "assets"]);

        let report = tasks.graph.run("assets", Policy::Continue).unwrap();
        assert!(report.success(), "{report}");
        assert!(report.node("sprite").is_some());

        let bindings: Vec<String> = tasks.watch_bindings().iter()
            .map(|b| b.pipeline().name().to_string())
            .collect();
        assert_eq!(bindings, ["styles", "scripts", "markup", "images", "fonts", "favicon"]);

        settings.tasks.insert(WATCH.into(), TaskSpec::default());
        assert!(Tasks::new(&settings).is_err());

        settings.tasks.remove(WATCH);
        settings.tasks.insert("broken".into(), TaskSpec { pipelines: vec!["nope".into()], ..TaskSpec::default() });
        assert!(Tasks::new(&settings).is_err());
    }
}
