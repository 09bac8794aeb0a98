use cv_reloc::{
    discover_maps, export_map, CapabilityRegistry, Localization, Localize, LocalizerSettings,
    MapRegistry, Query,
};
use log::*;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(
    name = "reloc-sandbox",
    about = "Localizes images against a prebuilt map and prints their geodetic poses"
)]
struct Opt {
    /// Directory holding `<dataset>/hlocMaps/<map id>` map directories.
    #[structopt(long, parse(from_os_str))]
    maps_root: Option<PathBuf>,
    /// Root that map configs were written under by the map builder.
    ///
    /// Paths under it are moved under `--maps-root` when maps are loaded.
    #[structopt(long, default_value = "/uploads", parse(from_os_str))]
    rewrite_root_from: PathBuf,
    /// The map to localize against.
    ///
    /// This is either a map id found under `--maps-root` or a map directory.
    #[structopt(short, long)]
    map: String,
    /// The file where settings are specified.
    ///
    /// This is in the format of `cv_reloc::LocalizerSettings`.
    #[structopt(short, long, default_value = "reloc-settings.json")]
    settings: PathBuf,
    /// The COLMAP camera model of the query images
    #[structopt(long, default_value = "SIMPLE_RADIAL")]
    model: String,
    /// Comma separated camera parameters in COLMAP order
    #[structopt(long, use_delimiter = true, allow_hyphen_values = true)]
    params: Vec<f64>,
    /// Output PLY file showing the map and the last localized camera
    #[structopt(short, long, parse(from_os_str))]
    output_ply: Option<PathBuf>,
    /// List of image files
    #[structopt(parse(from_os_str))]
    images: Vec<PathBuf>,
}

fn main() {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();

    let settings = std::fs::File::open(&opt.settings)
        .ok()
        .and_then(|file| serde_json::from_reader(file).ok());
    if settings.is_some() {
        info!("loaded existing settings");
    } else {
        info!("used default settings");
    }
    let settings: LocalizerSettings = settings.unwrap_or_default();

    let directory = match &opt.maps_root {
        Some(root) => match discover_maps(root) {
            Ok(mut maps) => match maps.remove(&opt.map) {
                Some(directory) => directory,
                None => {
                    error!(
                        "map {} not found under {}, available: {:?}",
                        opt.map,
                        root.display(),
                        maps.keys().collect::<Vec<_>>()
                    );
                    std::process::exit(1);
                }
            },
            Err(e) => {
                error!("unable to search {} for maps: {}", root.display(), e);
                std::process::exit(1);
            }
        },
        None => PathBuf::from(&opt.map),
    };

    let mut registry = MapRegistry::new(CapabilityRegistry::new(), settings);
    if let Some(root) = &opt.maps_root {
        registry = registry.with_root_rewrite(&opt.rewrite_root_from, root);
    }
    if let Err(e) = registry.load(&opt.map, &directory) {
        error!("unable to load map {}: {}", opt.map, e);
        std::process::exit(1);
    }
    let localizer = match registry.localizer(&opt.map) {
        Some(localizer) => localizer,
        None => {
            error!("map {} has no reconstruction", opt.map);
            std::process::exit(1);
        }
    };

    let mut last: Option<Localization> = None;
    for path in &opt.images {
        let image = match image::open(path) {
            Ok(image) => image,
            Err(e) => {
                error!("unable to load image {}: {}", path.display(), e);
                continue;
            }
        };
        let query = Query {
            image,
            camera_model: opt.model.clone(),
            params: opt.params.clone(),
        };
        match localizer.localize(&query) {
            Ok(localization) => {
                let line = serde_json::json!({
                    "image": path.display().to_string(),
                    "geopose": localization.geopose,
                    "inliers": localization.num_inliers,
                    "degraded": localization.degraded,
                });
                println!("{}", line);
                last = Some(localization);
            }
            Err(failure) => {
                warn!("{}: {}", path.display(), failure);
                println!("{}: no pose", path.display());
            }
        }
    }

    if let Some(path) = opt.output_ply {
        info!("exporting the map to {}", path.display());
        let query = last.as_ref().map(|l| (&l.pose, &l.camera));
        let result = std::fs::File::create(&path)
            .and_then(|file| export_map(std::io::BufWriter::new(file), localizer.map(), query));
        if let Err(e) = result {
            error!("unable to export to {}: {}", path.display(), e);
        }
    }
}
