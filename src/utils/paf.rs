// Functions and definitions for the minimap2-associated PAF file format
use anyhow::{Result, anyhow};
use fxhash::FxHashMap as HashMap;
use crate::config::conditions::Strand;
use crate::utils::mapping::AlignmentHit;

#[derive(Debug, Clone)]
pub struct PafRecord {
    pub qname: String,
    pub qlen: u64,
    pub qstart: u64,
    pub qend: u64,
    pub strand: char,
    pub tname: String,
    pub tlen: u64,
    pub tstart: u64,
    pub tend: u64,
    pub nmatch: u64,
    pub alen: u64,
    pub mapq: u64,
    tags: HashMap<String, String>,
}

impl PafRecord {
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut fields = line.split('\t');
        let qname = fields.next().ok_or_else(|| anyhow!("Missing qname"))?.to_string();
        let qlen = fields.next().ok_or_else(|| anyhow!("Missing qlen"))?.parse()?;
        let qstart = fields.next().ok_or_else(|| anyhow!("Missing qstart"))?.parse()?;
        let qend = fields.next().ok_or_else(|| anyhow!("Missing qend"))?.parse()?;
        let strand = fields.next().ok_or_else(|| anyhow!("Missing strand"))?.chars().next().ok_or_else(|| anyhow!("Invalid strand"))?;
        let tname = fields.next().ok_or_else(|| anyhow!("Missing tname"))?.to_string();
        let tlen = fields.next().ok_or_else(|| anyhow!("Missing tlen"))?.parse()?;
        let tstart = fields.next().ok_or_else(|| anyhow!("Missing tstart"))?.parse()?;
        let tend = fields.next().ok_or_else(|| anyhow!("Missing tend"))?.parse()?;
        let nmatch = fields.next().ok_or_else(|| anyhow!("Missing nmatch"))?.parse()?;
        let alen = fields.next().ok_or_else(|| anyhow!("Missing alen"))?.parse()?;
        let mapq = fields.next().ok_or_else(|| anyhow!("Missing mapq"))?.parse()?;

        let mut tags = HashMap::default();
        for tag_str in fields {
            let parts: Vec<&str> = tag_str.splitn(3, ':').collect();
            if parts.len() == 3 {
                tags.insert(parts[0].to_string(), parts[2].to_string());
            }
        }

        Ok(Self {
            qname, qlen, qstart, qend, strand, tname, tlen, tstart, tend, nmatch, alen, mapq, tags,
        })
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// False for secondary and supplementary alignments when minimap2 reports `tp`.
    pub fn is_primary(&self) -> bool {
        self.tag("tp").is_none_or(|t| t == "P")
    }

    pub fn to_hit(&self) -> Result<AlignmentHit> {
        let strand = Strand::parse(&self.strand.to_string())
            .ok_or_else(|| anyhow!("Invalid strand {} for {}", self.strand, self.qname))?;
        Ok(AlignmentHit {
            contig: self.tname.clone(),
            ref_start: self.tstart,
            ref_end: self.tend,
            strand,
            matched_length: self.nmatch,
        })
    }
}
