fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", gobackup_operator::crd::generate_crds()?);
    Ok(())
}
