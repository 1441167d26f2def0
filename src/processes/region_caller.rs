// Description:      Loads a region file and a read FASTA, recruits and
//                    assembles reads per region, and prints variant calls.

use std::io::{BufWriter, Write};

use zoe::data::err::OrFail;

use crate::args::region_caller::RegionCallerArgs;
use crate::backend::{SimpleKmerIndex, SimpleSeqStore};
use crate::queue::{parse_region_line, RegionQueue};
use crate::snv::SnvTable;

pub fn region_caller_process(args: &RegionCallerArgs) {
    let store = SimpleSeqStore::load(args.reads_file());
    let index = SimpleKmerIndex::build(&store, args.word_len());

    let snvs = args
        .snv_table()
        .map(|path| SnvTable::load(path).unwrap_or_die(&format!("cannot read SNV table '{}'", path.display())));
    let fps = args
        .fp_table()
        .map(|path| SnvTable::load(path).unwrap_or_die(&format!("cannot read FP table '{}'", path.display())));

    let region_text =
        std::fs::read_to_string(args.region_file()).unwrap_or_die(&format!("cannot read region file '{}'", args.region_file().display()));

    let config = args.to_config();

    let mut regions = Vec::new();
    for (lineno, line) in region_text.lines().enumerate() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        if regions.len() as u64 >= config.max_regions {
            break;
        }
        match parse_region_line(line) {
            Some(mut region) => {
                region.kmers.truncate(config.max_kmers);
                regions.push(region);
            }
            None => eprintln!("gasm-core: skipping malformed region file line {}: {line}", lineno + 1),
        }
    }

    let n_regions = regions.len();
    let queue = RegionQueue::new(&index, &store, config, snvs.as_ref(), fps.as_ref());

    let mut writer = BufWriter::new(std::io::stdout());
    let mut header = String::from("#CHR\tPOS\tREF\tCOVERAGE\tCALL\tCLASS\tP\tPREV");
    if args.print_counts() {
        header.push_str("\tA\tC\tG\tT\tN\tGAP");
    }
    writeln!(writer, "{header}").ok();

    let n_processed = queue.run(regions, writer, args.print_counts(), args.rng_seed());
    eprintln!("gasm-core: processed {n_processed}/{n_regions} regions");
}
