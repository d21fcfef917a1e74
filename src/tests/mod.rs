mod extendible_hash_table_test;
